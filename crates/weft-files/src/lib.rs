//! # WEFT Files
//!
//! Content engine for the WEFT mesh.
//!
//! This crate provides:
//! - Piece-size policies (fixed 5 MiB, or graduated by file size)
//! - Streaming chunking with per-piece SHA-256 or BLAKE3 digests and optional SHA-1 legacy digests
//! - Layered merkle trees with inclusion proofs
//! - Transfer metadata carried in `TorrentInit`
//! - Sender-side frame streaming and receiver-side piece reassembly
//! - The storage collaborator trait with memory and filesystem stores

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod merkle;
pub mod piece;
pub mod reassembly;
pub mod store;
pub mod transfer;

pub use chunker::{ChunkOptions, Chunker};
pub use digest::PieceDigest;
pub use error::{FilesError, Result};
pub use manifest::{PieceManifest, TorrentMetadata};
pub use merkle::{MerkleProof, MerkleTree};
pub use piece::{ContentPiece, PieceLayout, PieceSizePolicy};
pub use reassembly::{
    AssembledFile, ChunkOutcome, CompletedTorrent, Ingest, ReassemblyLimits, Reassembler,
    TorrentSession,
};
pub use store::{ContentStore, FsStore, MemoryStore};
pub use transfer::{StreamStats, stream_bytes, stream_file, stream_source};

/// Piece size for the lightweight fixed-size path (5 MiB)
pub const FIXED_PIECE_SIZE: u32 = 5 * 1024 * 1024;

/// Sub-chunk size for `PieceChunk` frames, well under data-channel message limits
pub const DEFAULT_FRAME_SIZE: usize = 16 * 1024;

/// Hex form of a root hash, used as the session and storage key
#[must_use]
pub fn root_key(root: &weft_core::RootHash) -> String {
    hex::encode(root)
}
