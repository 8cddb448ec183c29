//! Sender-side frame streaming.
//!
//! A transfer is `TorrentInit` followed by every piece cut into
//! `PieceChunk` frames of at most `frame_size` payload bytes. Frames go into
//! a bounded channel, so a slow link holds the reader back instead of
//! letting frames pile up in memory.

use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use weft_core::PieceChunkHeader;

use crate::error::{FilesError, Result};
use crate::manifest::PieceManifest;

/// Summary of a completed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames sent, including `TorrentInit`
    pub frames: u64,
    /// Content bytes sent
    pub bytes: u64,
}

/// Stream `manifest`'s content from `reader` into `sink`.
///
/// The reader must yield the same bytes that were chunked. An empty file
/// still sends one empty chunk so the receiver can complete its single
/// zero-length piece.
///
/// # Errors
///
/// Returns [`FilesError::ChunkingFailed`] if the reader fails or ends early,
/// and [`FilesError::ChannelClosed`] if the receiving side of `sink` is gone.
pub async fn stream_source<R>(
    manifest: &PieceManifest,
    mut reader: R,
    frame_size: usize,
    sink: &mpsc::Sender<Bytes>,
) -> Result<StreamStats>
where
    R: AsyncRead + Unpin,
{
    let frame_size = frame_size.max(1);
    let root = manifest.root();
    let mut stats = StreamStats { frames: 0, bytes: 0 };

    send(sink, manifest.init_message()?).await?;
    stats.frames += 1;

    let mut buffer = vec![0u8; frame_size];
    for piece in manifest.layout().pieces() {
        let len = piece.size as usize;
        let mut offset = 0usize;
        loop {
            let take = (len - offset).min(frame_size);
            let chunk = &mut buffer[..take];
            reader
                .read_exact(chunk)
                .await
                .map_err(FilesError::ChunkingFailed)?;

            let header = PieceChunkHeader {
                root,
                index: piece.index,
                offset: offset as u32,
            };
            send(sink, header.to_message(chunk)).await?;
            stats.frames += 1;
            stats.bytes += take as u64;
            offset += take;

            if offset >= len {
                break;
            }
        }
        trace!(index = piece.index, size = piece.size, "piece sent");
    }

    debug!(
        root = %hex::encode(root),
        frames = stats.frames,
        bytes = stats.bytes,
        "transfer streamed"
    );
    Ok(stats)
}

/// Stream a file from disk.
///
/// # Errors
///
/// See [`stream_source`]; opening the file maps to
/// [`FilesError::ChunkingFailed`].
pub async fn stream_file(
    manifest: &PieceManifest,
    path: &Path,
    frame_size: usize,
    sink: &mpsc::Sender<Bytes>,
) -> Result<StreamStats> {
    let file = File::open(path).await.map_err(FilesError::ChunkingFailed)?;
    stream_source(manifest, BufReader::new(file), frame_size, sink).await
}

/// Stream an in-memory buffer.
///
/// # Errors
///
/// See [`stream_source`].
pub async fn stream_bytes(
    manifest: &PieceManifest,
    data: &[u8],
    frame_size: usize,
    sink: &mpsc::Sender<Bytes>,
) -> Result<StreamStats> {
    stream_source(manifest, data, frame_size, sink).await
}

async fn send(sink: &mpsc::Sender<Bytes>, frame: Bytes) -> Result<()> {
    sink.send(frame).await.map_err(|_| FilesError::ChannelClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkOptions, Chunker};
    use crate::piece::PieceSizePolicy;
    use crate::reassembly::{Ingest, Reassembler};
    use std::time::Instant;
    use weft_core::{Reason, decode};

    fn manifest(data: &[u8], piece_size: u32) -> PieceManifest {
        Chunker::new(ChunkOptions {
            policy: PieceSizePolicy::Fixed(piece_size),
            ..Default::default()
        })
        .chunk_bytes("payload", data)
        .unwrap()
    }

    async fn collect(m: &PieceManifest, data: &[u8], frame: usize) -> Vec<Bytes> {
        let (tx, mut rx) = mpsc::channel(1024);
        stream_bytes(m, data, frame, &tx).await.unwrap();
        drop(tx);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn test_frame_sequence() {
        let data: Vec<u8> = (0..24576u32).map(|i| i as u8).collect();
        let m = manifest(&data, 16384);
        let frames = collect(&m, &data, 8192).await;

        // init + 2 frames for piece 0 + 1 frame for piece 1
        assert_eq!(frames.len(), 4);
        assert_eq!(decode(&frames[0]).unwrap().0, Reason::TorrentInit);

        let offsets: Vec<(u32, u32, usize)> = frames[1..]
            .iter()
            .map(|f| {
                let (reason, payload) = decode(f).unwrap();
                assert_eq!(reason, Reason::PieceChunk);
                let (h, chunk) = PieceChunkHeader::parse(payload).unwrap();
                (h.index, h.offset, chunk.len())
            })
            .collect();
        assert_eq!(offsets, vec![(0, 0, 8192), (0, 8192, 8192), (1, 0, 8192)]);
    }

    #[tokio::test]
    async fn test_empty_file_sends_one_empty_chunk() {
        let m = manifest(&[], 16384);
        let frames = collect(&m, &[], 16384).await;
        assert_eq!(frames.len(), 2);
        let (_, payload) = decode(&frames[1]).unwrap();
        let (h, chunk) = PieceChunkHeader::parse(payload).unwrap();
        assert_eq!((h.index, h.offset), (0, 0));
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_streamed_frames_reassemble() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let m = manifest(&data, 32768);
        let mut frames = collect(&m, &data, 5000).await;

        let mut r = Reassembler::default();
        let now = Instant::now();
        r.open(&frames.remove(0)[1..], now).unwrap();
        frames.reverse();

        let mut done = None;
        for f in frames {
            if let Ingest::Complete { torrent, .. } = r.ingest(f.slice(1..), now).unwrap() {
                done = Some(torrent);
            }
        }
        let file = done.unwrap().verify().unwrap();
        assert_eq!(&file.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_closed_sink() {
        let data = vec![0u8; 100];
        let m = manifest(&data, 50);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = stream_bytes(&m, &data, 10, &tx).await.unwrap_err();
        assert!(matches!(err, FilesError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_short_reader() {
        let data = vec![0u8; 100];
        let m = manifest(&data, 50);
        let (tx, _rx) = mpsc::channel(64);
        let err = stream_bytes(&m, &data[..60], 10, &tx).await.unwrap_err();
        assert!(matches!(err, FilesError::ChunkingFailed(_)));
    }
}
