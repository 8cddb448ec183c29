//! Error types for chunking, reassembly and storage.

use std::time::Duration;

use thiserror::Error;
use weft_core::CodecError;

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, FilesError>;

/// Content engine errors
#[derive(Debug, Error)]
pub enum FilesError {
    /// Reading the source stream failed; no partial tree is produced
    #[error("chunking failed: {0}")]
    ChunkingFailed(#[source] std::io::Error),

    /// Piece size of zero
    #[error("invalid piece size: {0}")]
    InvalidPieceSize(u32),

    /// File would need more than `u32::MAX` pieces
    #[error("{total} bytes at piece size {piece_size} exceeds the piece index range")]
    TooManyPieces {
        /// Total content length
        total: u64,
        /// Nominal piece size
        piece_size: u32,
    },

    /// A merkle tree needs at least one leaf
    #[error("merkle tree has no leaves")]
    EmptyTree,

    /// Wire header could not be parsed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Metadata JSON is malformed
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// `TorrentInit` header and metadata disagree
    #[error("header mismatch: {0}")]
    HeaderMismatch(String),

    /// Chunk names a root with no open session
    #[error("no open session for root {0}")]
    UnknownSession(String),

    /// Piece index outside `0..pieceCount`
    #[error("piece {index} out of range (count {count})")]
    PieceOutOfRange {
        /// Offending index
        index: u32,
        /// Session piece count
        count: u32,
    },

    /// Chunk extends past the end of its piece
    #[error("chunk at piece {index} offset {offset} len {len} exceeds piece length {expected}")]
    ChunkOutOfBounds {
        /// Piece index
        index: u32,
        /// Chunk offset
        offset: u32,
        /// Chunk length
        len: usize,
        /// Expected piece length
        expected: u32,
    },

    /// Encoded message would not fit one data-channel send
    #[error("{what} message is {size} bytes, limit {max}")]
    MessageTooLarge {
        /// Message kind
        what: &'static str,
        /// Encoded size
        size: usize,
        /// Largest allowed size
        max: usize,
    },

    /// Session buffer cap reached
    #[error("resource exhausted: {buffered} bytes buffered, cap {cap}")]
    ResourceExhausted {
        /// Bytes held when the chunk arrived
        buffered: u64,
        /// Configured cap
        cap: u64,
    },

    /// A piece digest does not match the metadata
    #[error("integrity mismatch in piece {0}")]
    PieceMismatch(u32),

    /// Recomputed merkle root differs from the announced root
    #[error("merkle root mismatch")]
    RootMismatch,

    /// Assembled length differs from the announced total size
    #[error("assembled {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Announced size
        expected: u64,
        /// Assembled size
        actual: u64,
    },

    /// Session saw no chunks for longer than the idle timeout
    #[error("transfer idle for {0:?}")]
    Timeout(Duration),

    /// Storage collaborator failed
    #[error("storage error: {0}")]
    Storage(#[source] std::io::Error),

    /// Frame sink went away mid-transfer
    #[error("transfer channel closed")]
    ChannelClosed,

    /// Blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for FilesError {
    fn from(err: tokio::task::JoinError) -> Self {
        FilesError::Task(err.to_string())
    }
}

impl FilesError {
    /// Whether this error ends the transfer rather than dropping one chunk
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FilesError::ResourceExhausted { .. }
                | FilesError::PieceMismatch(_)
                | FilesError::RootMismatch
                | FilesError::SizeMismatch { .. }
                | FilesError::Timeout(_)
                | FilesError::Storage(_)
                | FilesError::Task(_)
        )
    }
}
