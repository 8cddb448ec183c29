//! Receiver-side piece reassembly.
//!
//! A [`TorrentSession`] is opened by `TorrentInit` and fed `PieceChunk`
//! payloads in any order. Each piece keeps an offset-ordered buffer of the
//! chunks seen so far; the first chunk written at an offset wins and later
//! copies are ignored. After every insert the piece is checked: if its chunks,
//! walked in offset order, form one contiguous run from zero to the piece's
//! expected length, they are joined and the piece moves to the completed set.
//!
//! Gaps and overlaps only defer completion. A session that stops making
//! progress is ended by its idle timeout, and a session that holds more than
//! its buffer cap is ended with [`FilesError::ResourceExhausted`].
//!
//! Hashing the assembled content is left to [`CompletedTorrent::verify`],
//! which is meant to run off the event loop.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};
use weft_core::{PIECE_CHUNK_HEADER_SIZE, PieceChunkHeader, RootHash, TorrentInitHeader};

use crate::digest::legacy_digest;
use crate::error::{FilesError, Result};
use crate::manifest::TorrentMetadata;
use crate::merkle::MerkleTree;
use crate::piece::PieceLayout;
use crate::root_key;

/// Bounds applied to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Bytes a session may hold across partial and completed pieces
    pub max_buffered_bytes: u64,
    /// Time without a new chunk after which a session fails
    pub idle_timeout: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 512 * 1024 * 1024,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// What one chunk did to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; its piece is still incomplete
    Buffered,
    /// Offset already written, or piece already complete
    Duplicate,
    /// This chunk completed piece `index`
    PieceCompleted {
        /// Completed piece
        index: u32,
    },
}

/// Bookkeeping for one in-progress transfer
#[derive(Debug)]
pub struct TorrentSession {
    header: TorrentInitHeader,
    metadata: TorrentMetadata,
    layout: PieceLayout,
    completed: BTreeMap<u32, Bytes>,
    partial: HashMap<u32, BTreeMap<u32, Bytes>>,
    buffered: u64,
    last_activity: Instant,
}

impl TorrentSession {
    /// Open a session from a `TorrentInit` payload (the bytes after the tag).
    ///
    /// # Errors
    ///
    /// Returns an error if the header is truncated or the metadata does not
    /// agree with it.
    pub fn open(payload: &[u8], now: Instant) -> Result<Self> {
        let (header, metadata) = TorrentInitHeader::parse(payload)?;
        let metadata = TorrentMetadata::parse_for(&header, metadata)?;
        let layout = PieceLayout::new(header.piece_size, header.total_size)?;
        Ok(Self {
            header,
            metadata,
            layout,
            completed: BTreeMap::new(),
            partial: HashMap::new(),
            buffered: 0,
            last_activity: now,
        })
    }

    /// Content root
    #[must_use]
    pub fn root(&self) -> RootHash {
        self.header.root
    }

    /// Transfer metadata
    #[must_use]
    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    /// Piece boundaries
    #[must_use]
    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Bytes currently held
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.buffered
    }

    /// Completed piece count
    #[must_use]
    pub fn completed_count(&self) -> u32 {
        self.completed.len() as u32
    }

    /// Every piece has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.layout.piece_count() as usize
    }

    /// Indices of pieces not yet complete
    #[must_use]
    pub fn missing_pieces(&self) -> Vec<u32> {
        (0..self.layout.piece_count())
            .filter(|i| !self.completed.contains_key(i))
            .collect()
    }

    /// Time since the last accepted chunk
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Buffer one chunk and try to complete its piece.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::PieceOutOfRange`] or
    /// [`FilesError::ChunkOutOfBounds`] for chunks outside the layout or
    /// empty chunks of a non-empty piece, and
    /// [`FilesError::ResourceExhausted`] when the chunk would push the session
    /// past `limits.max_buffered_bytes`.
    pub fn insert(
        &mut self,
        index: u32,
        offset: u32,
        chunk: Bytes,
        limits: &ReassemblyLimits,
        now: Instant,
    ) -> Result<ChunkOutcome> {
        let count = self.layout.piece_count();
        let expected = self
            .layout
            .piece_len(index)
            .ok_or(FilesError::PieceOutOfRange { index, count })?;

        // only an empty piece takes an empty chunk
        let end = u64::from(offset) + chunk.len() as u64;
        let starts_inside = offset < expected || (offset == 0 && expected == 0);
        let empty_in_full = chunk.is_empty() && expected > 0;
        if !starts_inside || empty_in_full || end > u64::from(expected) {
            return Err(FilesError::ChunkOutOfBounds {
                index,
                offset,
                len: chunk.len(),
                expected,
            });
        }

        if self.completed.contains_key(&index) {
            return Ok(ChunkOutcome::Duplicate);
        }
        let piece = self.partial.entry(index).or_default();
        if piece.contains_key(&offset) {
            return Ok(ChunkOutcome::Duplicate);
        }

        let held = self.buffered + chunk.len() as u64;
        if held > limits.max_buffered_bytes {
            return Err(FilesError::ResourceExhausted {
                buffered: self.buffered,
                cap: limits.max_buffered_bytes,
            });
        }

        self.buffered = held;
        self.last_activity = now;
        piece.insert(offset, chunk);

        if self.try_complete(index, expected) {
            Ok(ChunkOutcome::PieceCompleted { index })
        } else {
            Ok(ChunkOutcome::Buffered)
        }
    }

    fn try_complete(&mut self, index: u32, expected: u32) -> bool {
        let Some(chunks) = self.partial.get(&index) else {
            return false;
        };

        let mut cursor: u64 = 0;
        for (offset, bytes) in chunks {
            if u64::from(*offset) != cursor {
                return false;
            }
            cursor += bytes.len() as u64;
        }
        if cursor != u64::from(expected) {
            return false;
        }

        let Some(chunks) = self.partial.remove(&index) else {
            return false;
        };
        let piece = if chunks.len() == 1 {
            chunks.into_values().next().unwrap_or_default()
        } else {
            let mut joined = BytesMut::with_capacity(expected as usize);
            for bytes in chunks.into_values() {
                joined.extend_from_slice(&bytes);
            }
            joined.freeze()
        };
        self.completed.insert(index, piece);
        true
    }

    /// Hand over the completed pieces for verification.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::HeaderMismatch`] if pieces are still missing.
    pub fn finish(self) -> Result<CompletedTorrent> {
        if !self.is_complete() {
            return Err(FilesError::HeaderMismatch(format!(
                "{} pieces missing",
                self.missing_pieces().len()
            )));
        }
        Ok(CompletedTorrent {
            header: self.header,
            metadata: self.metadata,
            pieces: self.completed.into_values().collect(),
        })
    }
}

/// All pieces of a transfer, not yet verified
#[derive(Debug)]
pub struct CompletedTorrent {
    header: TorrentInitHeader,
    metadata: TorrentMetadata,
    pieces: Vec<Bytes>,
}

/// Verified, assembled content ready for storage
#[derive(Debug, Clone)]
pub struct AssembledFile {
    /// Content root
    pub root: RootHash,
    /// File name from the metadata
    pub name: String,
    /// Full content
    pub data: Bytes,
}

impl CompletedTorrent {
    /// Content root
    #[must_use]
    pub fn root(&self) -> RootHash {
        self.header.root
    }

    /// Re-hash every piece, rebuild the merkle root, and join the pieces.
    ///
    /// CPU-bound; run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::PieceMismatch`] for the first piece whose digest
    /// differs from the metadata, [`FilesError::RootMismatch`] if the rebuilt
    /// root differs from the announced one, and [`FilesError::SizeMismatch`]
    /// if the joined length is wrong.
    pub fn verify(self) -> Result<AssembledFile> {
        let digest = self.metadata.digest;
        let announced = self.metadata.piece_hashes()?;
        let legacy = self.metadata.legacy_hashes()?;

        let mut leaves = Vec::with_capacity(self.pieces.len());
        for (i, piece) in self.pieces.iter().enumerate() {
            let hash = digest.hash(piece);
            if announced.get(i) != Some(&hash) {
                return Err(FilesError::PieceMismatch(i as u32));
            }
            if let Some(legacy) = &legacy {
                if legacy.get(i) != Some(&legacy_digest(piece)) {
                    return Err(FilesError::PieceMismatch(i as u32));
                }
            }
            leaves.push(hash);
        }

        if MerkleTree::from_leaves(digest, leaves)?.root() != self.header.root {
            return Err(FilesError::RootMismatch);
        }

        let actual: u64 = self.pieces.iter().map(|p| p.len() as u64).sum();
        if actual != self.header.total_size {
            return Err(FilesError::SizeMismatch {
                expected: self.header.total_size,
                actual,
            });
        }

        let mut data = BytesMut::with_capacity(actual as usize);
        for piece in &self.pieces {
            data.extend_from_slice(piece);
        }

        Ok(AssembledFile {
            root: self.header.root,
            name: self.metadata.name,
            data: data.freeze(),
        })
    }
}

/// Result of feeding one chunk to the [`Reassembler`]
#[derive(Debug)]
pub enum Ingest {
    /// Chunk stored or ignored; transfer continues
    Progress(ChunkOutcome),
    /// The chunk completed piece `index` but other pieces remain
    PieceCompleted {
        /// Content root
        root: RootHash,
        /// Completed piece
        index: u32,
    },
    /// Every piece has arrived; the session is closed
    Complete {
        /// Last completed piece
        index: u32,
        /// Pieces ready for verification
        torrent: CompletedTorrent,
    },
}

/// All open sessions on one node, keyed by hex root
#[derive(Debug, Default)]
pub struct Reassembler {
    sessions: HashMap<String, TorrentSession>,
    limits: ReassemblyLimits,
}

impl Reassembler {
    /// Create a reassembler
    #[must_use]
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            sessions: HashMap::new(),
            limits,
        }
    }

    /// Open sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// No open sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session
    #[must_use]
    pub fn session(&self, root: &RootHash) -> Option<&TorrentSession> {
        self.sessions.get(&root_key(root))
    }

    /// Handle a `TorrentInit` payload.
    ///
    /// Returns `false` if a session for that root is already open; the
    /// existing session is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed.
    pub fn open(&mut self, payload: &[u8], now: Instant) -> Result<(RootHash, bool)> {
        let session = TorrentSession::open(payload, now)?;
        let root = session.root();
        let key = root_key(&root);
        if self.sessions.contains_key(&key) {
            debug!(root = %key, "duplicate TorrentInit ignored");
            return Ok((root, false));
        }
        debug!(
            root = %key,
            pieces = session.layout().piece_count(),
            total = session.layout().total_size(),
            "transfer session opened"
        );
        self.sessions.insert(key, session);
        Ok((root, true))
    }

    /// Handle a `PieceChunk` payload (the bytes after the tag).
    ///
    /// A session that hits its buffer cap is dropped before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::UnknownSession`] for chunks with no open session,
    /// bounds errors for misplaced chunks, and
    /// [`FilesError::ResourceExhausted`] when the cap is reached.
    pub fn ingest(&mut self, payload: Bytes, now: Instant) -> Result<Ingest> {
        let (header, _) = PieceChunkHeader::parse(&payload)?;
        let chunk = payload.slice(PIECE_CHUNK_HEADER_SIZE..);
        let key = root_key(&header.root);

        let session = self
            .sessions
            .get_mut(&key)
            .ok_or_else(|| FilesError::UnknownSession(key.clone()))?;

        let outcome = match session.insert(header.index, header.offset, chunk, &self.limits, now)
        {
            Ok(outcome) => outcome,
            Err(err @ FilesError::ResourceExhausted { .. }) => {
                warn!(root = %key, error = %err, "dropping transfer session");
                self.sessions.remove(&key);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match outcome {
            ChunkOutcome::PieceCompleted { index } if session.is_complete() => {
                let torrent = self
                    .sessions
                    .remove(&key)
                    .ok_or_else(|| FilesError::UnknownSession(key.clone()))?
                    .finish()?;
                Ok(Ingest::Complete { index, torrent })
            }
            ChunkOutcome::PieceCompleted { index } => Ok(Ingest::PieceCompleted {
                root: header.root,
                index,
            }),
            other => Ok(Ingest::Progress(other)),
        }
    }

    /// Drop a session
    pub fn abort(&mut self, root: &RootHash) -> bool {
        self.sessions.remove(&root_key(root)).is_some()
    }

    /// Remove sessions idle past the timeout and report them
    pub fn expire(&mut self, now: Instant) -> Vec<(RootHash, FilesError)> {
        let timeout = self.limits.idle_timeout;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.idle_for(now) > timeout)
            .map(|(k, _)| k.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .map(|s| {
                warn!(
                    root = %root_key(&s.root()),
                    missing = s.missing_pieces().len(),
                    "transfer session timed out"
                );
                (s.root(), FilesError::Timeout(s.idle_for(now)))
            })
            .collect()
    }
}
