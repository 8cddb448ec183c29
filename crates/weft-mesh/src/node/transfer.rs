//! Upload, download and receive paths.
//!
//! Hashing, streaming, verification and storage run on spawned tasks; their
//! results come back to the actor as [`TaskReport`]s. Replies that only need
//! a store lookup are sent straight from the task through a cloned link.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use weft_core::frame::{root_message, split_root};
use weft_core::{
    DownloadResponse, PeerId, PieceAck, PieceChunkHeader, Reason, RootHash, UploadIntent,
    UploadResponse,
};
use weft_files::{Chunker, FilesError, Ingest, PieceManifest, StreamStats, root_key};

use super::{MeshNode, NodeEvent};
use crate::error::{MeshError, Result};

pub(super) struct PendingUpload {
    manifest: Arc<PieceManifest>,
    path: PathBuf,
    acked: HashSet<u32>,
}

pub(super) enum TaskReport {
    Chunked {
        peer: PeerId,
        path: PathBuf,
        manifest: weft_files::Result<PieceManifest>,
        reply: oneshot::Sender<Result<RootHash>>,
    },
    Streamed {
        peer: PeerId,
        root: RootHash,
        result: weft_files::Result<StreamStats>,
    },
    Stored {
        root: RootHash,
        result: weft_files::Result<(String, u64)>,
    },
}

impl MeshNode {
    pub(super) fn on_task(&mut self, report: TaskReport) {
        match report {
            TaskReport::Chunked {
                peer,
                path,
                manifest,
                reply,
            } => {
                let _ = reply.send(self.offer_upload(peer, path, manifest));
            }
            TaskReport::Streamed { peer, root, result } => match result {
                Ok(stats) => debug!(
                    peer = %peer.short(),
                    root = %root_key(&root),
                    frames = stats.frames,
                    bytes = stats.bytes,
                    "content streamed"
                ),
                Err(e) => {
                    warn!(peer = %peer.short(), root = %root_key(&root), error = %e, "stream failed");
                    if self.uploads.remove(&(peer, root)).is_some() {
                        self.emit(NodeEvent::TransferFailed {
                            root,
                            reason: e.to_string(),
                        });
                    }
                }
            },
            TaskReport::Stored { root, result } => match result {
                Ok((name, size)) => {
                    info!(root = %root_key(&root), %name, size, "import complete");
                    self.emit(NodeEvent::ImportComplete { root, name, size });
                }
                Err(e) => {
                    warn!(root = %root_key(&root), error = %e, "import failed");
                    self.emit(NodeEvent::TransferFailed {
                        root,
                        reason: e.to_string(),
                    });
                }
            },
        }
    }

    // ============ Sending side ============

    pub(super) fn start_upload(
        &mut self,
        peer: PeerId,
        path: PathBuf,
        reply: oneshot::Sender<Result<RootHash>>,
    ) {
        if !self.connected.contains_key(&peer) {
            let _ = reply.send(Err(MeshError::PeerNotFound(peer)));
            return;
        }
        let chunker = Chunker::new(self.config.chunk);
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            // an init message too big to send fails the upload before it is offered
            let manifest = chunker
                .chunk_file(&path)
                .await
                .and_then(|m| m.init_message().map(|_| m));
            let _ = tx.send(TaskReport::Chunked {
                peer,
                path,
                manifest,
                reply,
            });
        });
    }

    fn offer_upload(
        &mut self,
        peer: PeerId,
        path: PathBuf,
        manifest: weft_files::Result<PieceManifest>,
    ) -> Result<RootHash> {
        let manifest = manifest?;
        let root = manifest.root();
        let intent = UploadIntent {
            root,
            name: manifest.name().to_string(),
            size: manifest.layout().total_size(),
        };
        if !self.send_to(&peer, intent.to_message()?) {
            return Err(MeshError::PeerNotFound(peer));
        }
        info!(
            peer = %peer.short(),
            root = %root_key(&root),
            pieces = manifest.layout().piece_count(),
            "upload offered"
        );
        self.uploads.insert(
            (peer, root),
            PendingUpload {
                manifest: Arc::new(manifest),
                path,
                acked: HashSet::new(),
            },
        );
        Ok(root)
    }

    pub(super) fn on_upload_response(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let response = UploadResponse::parse(payload)?;
        let root = response.root;
        let Some(upload) = self.uploads.get(&(from, root)) else {
            debug!(peer = %from.short(), root = %root_key(&root), "response for unknown upload");
            return Ok(());
        };
        if !response.accepted {
            self.uploads.remove(&(from, root));
            info!(peer = %from.short(), root = %root_key(&root), "upload declined, content already held");
            self.emit(NodeEvent::UploadRejected { peer: from, root });
            return Ok(());
        }

        let data = self
            .connected
            .get(&from)
            .map(|p| p.link.data())
            .ok_or(MeshError::PeerNotFound(from))?;
        let manifest = Arc::clone(&upload.manifest);
        let path = upload.path.clone();
        let frame_size = self.config.frame_size;
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = weft_files::stream_file(&manifest, &path, frame_size, &data).await;
            let _ = tx.send(TaskReport::Streamed {
                peer: from,
                root,
                result,
            });
        });
        Ok(())
    }

    pub(super) fn on_piece_ack(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let ack = PieceAck::parse(payload)?;
        let Some(upload) = self.uploads.get_mut(&(from, ack.root)) else {
            debug!(peer = %from.short(), "ack for unknown upload");
            return Ok(());
        };
        let total = upload.manifest.layout().piece_count();
        if ack.index >= total {
            return Err(FilesError::PieceOutOfRange {
                index: ack.index,
                count: total,
            }
            .into());
        }
        upload.acked.insert(ack.index);
        let acked = upload.acked.len() as u32;
        self.emit(NodeEvent::UploadProgress {
            peer: from,
            root: ack.root,
            acked,
            total,
        });
        if acked == total {
            self.uploads.remove(&(from, ack.root));
            info!(peer = %from.short(), root = %root_key(&ack.root), "upload acknowledged");
        }
        Ok(())
    }

    pub(super) fn start_download(&mut self, peer: PeerId, root: RootHash) -> Result<()> {
        let msg = root_message(Reason::Download, &root, &[]);
        if !self.send_to(&peer, msg) {
            return Err(MeshError::PeerNotFound(peer));
        }
        debug!(peer = %peer.short(), root = %root_key(&root), "download requested");
        Ok(())
    }

    // ============ Serving side ============

    pub(super) fn on_upload(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let intent = UploadIntent::parse(payload)?;
        let link = self
            .connected
            .get(&from)
            .map(|p| p.link.clone())
            .ok_or(MeshError::PeerNotFound(from))?;
        let store = Arc::clone(&self.store);
        debug!(peer = %from.short(), name = %intent.name, size = intent.size, "upload offered to us");
        tokio::spawn(async move {
            let accepted = match store.contains(&intent.root).await {
                Ok(held) => !held,
                Err(e) => {
                    warn!(error = %e, "store lookup failed, declining upload");
                    false
                }
            };
            link.send(
                UploadResponse {
                    root: intent.root,
                    accepted,
                }
                .to_message(),
            );
        });
        Ok(())
    }

    pub(super) fn on_download(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let (root, _) = split_root(payload)?;
        let link = self
            .connected
            .get(&from)
            .map(|p| p.link.clone())
            .ok_or(MeshError::PeerNotFound(from))?;
        let store = Arc::clone(&self.store);
        let chunker = Chunker::new(self.config.chunk);
        let frame_size = self.config.frame_size;
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            let data = match store.get(&root).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    link.send(DownloadResponse { root, found: false }.to_message());
                    return;
                }
                Err(e) => {
                    warn!(root = %root_key(&root), error = %e, "store read failed");
                    link.send(DownloadResponse { root, found: false }.to_message());
                    return;
                }
            };
            let name = match store.name(&root).await {
                Ok(Some(name)) => name,
                Ok(None) => root_key(&root),
                Err(e) => {
                    debug!(root = %root_key(&root), error = %e, "stored name unreadable");
                    root_key(&root)
                }
            };
            let manifest = match rechunk(chunker, root, name, data.clone()).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(root = %root_key(&root), error = %e, "stored content not servable");
                    link.send(DownloadResponse { root, found: false }.to_message());
                    return;
                }
            };
            link.send(DownloadResponse { root, found: true }.to_message());
            let result = weft_files::stream_bytes(&manifest, &data, frame_size, &link.data()).await;
            let _ = tx.send(TaskReport::Streamed {
                peer: from,
                root,
                result,
            });
        });
        Ok(())
    }

    // ============ Receiving side ============

    pub(super) fn on_download_response(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let response = DownloadResponse::parse(payload)?;
        if response.found {
            debug!(peer = %from.short(), root = %root_key(&response.root), "download starting");
        } else {
            info!(peer = %from.short(), root = %root_key(&response.root), "peer does not hold content");
            self.emit(NodeEvent::DownloadMissing {
                peer: from,
                root: response.root,
            });
        }
        Ok(())
    }

    pub(super) fn on_torrent_init(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let (root, fresh) = self.reassembler.open(payload, Instant::now())?;
        if fresh {
            info!(peer = %from.short(), root = %root_key(&root), "receiving content");
        }
        Ok(())
    }

    pub(super) fn on_piece_chunk(&mut self, from: PeerId, payload: Bytes) -> Result<()> {
        let (header, _) = PieceChunkHeader::parse(&payload)?;
        let outcome = match self.reassembler.ingest(payload, Instant::now()) {
            Ok(outcome) => outcome,
            Err(e) if e.is_terminal() => {
                self.emit(NodeEvent::TransferFailed {
                    root: header.root,
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        match outcome {
            Ingest::Progress(_) => {}
            Ingest::PieceCompleted { root, index } => {
                self.send_to(&from, PieceAck { root, index }.to_message());
            }
            Ingest::Complete { index, torrent } => {
                let root = torrent.root();
                self.send_to(&from, PieceAck { root, index }.to_message());
                let store = Arc::clone(&self.store);
                let tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result: weft_files::Result<(String, u64)> = async {
                        let file = tokio::task::spawn_blocking(move || torrent.verify()).await??;
                        let size = file.data.len() as u64;
                        store.put(file.root, &file.name, file.data).await?;
                        Ok((file.name, size))
                    }
                    .await;
                    let _ = tx.send(TaskReport::Stored { root, result });
                });
            }
        }
        Ok(())
    }
}

/// Rebuild the manifest for stored content and check it still names `root`
async fn rechunk(
    chunker: Chunker,
    root: RootHash,
    name: String,
    data: Bytes,
) -> weft_files::Result<PieceManifest> {
    let manifest =
        tokio::task::spawn_blocking(move || chunker.chunk_bytes(&name, &data)).await??;
    if manifest.root() != root {
        return Err(FilesError::RootMismatch);
    }
    manifest.init_message()?;
    Ok(manifest)
}
