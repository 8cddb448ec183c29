//! Streaming file chunking.
//!
//! Reads a source one piece at a time, so only a single piece buffer is ever
//! resident, and hashes each piece as it is read. Any read error aborts the
//! whole run with [`FilesError::ChunkingFailed`]; no partial manifest escapes.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::digest::{PieceDigest, legacy_digest};
use crate::error::{FilesError, Result};
use crate::manifest::PieceManifest;
use crate::merkle::MerkleTree;
use crate::piece::PieceSizePolicy;

/// Chunking parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkOptions {
    /// Piece size policy
    pub policy: PieceSizePolicy,
    /// Piece and parent digest
    pub digest: PieceDigest,
    /// Also compute SHA-1 per piece
    pub legacy: bool,
}

/// Splits sources into hashed pieces
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    options: ChunkOptions,
}

impl Chunker {
    /// Create a chunker
    #[must_use]
    pub fn new(options: ChunkOptions) -> Self {
        Self { options }
    }

    /// Options in use
    #[must_use]
    pub fn options(&self) -> &ChunkOptions {
        &self.options
    }

    /// Chunk `total_size` bytes from `reader`.
    ///
    /// The reader must yield exactly `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkingFailed`] on read errors, on a short
    /// source, or on a source longer than `total_size`.
    pub fn chunk_reader<R: Read>(
        &self,
        name: &str,
        mut reader: R,
        total_size: u64,
    ) -> Result<PieceManifest> {
        let layout = self.options.policy.layout(total_size)?;
        let digest = self.options.digest;

        let mut hashes = Vec::with_capacity(layout.piece_count() as usize);
        let mut legacy = self
            .options
            .legacy
            .then(|| Vec::with_capacity(layout.piece_count() as usize));
        let mut buffer = vec![0u8; layout.piece_size().min(clamp(total_size)) as usize];

        for piece in layout.pieces() {
            let data = &mut buffer[..piece.size as usize];
            reader
                .read_exact(data)
                .map_err(FilesError::ChunkingFailed)?;
            hashes.push(digest.hash(data));
            if let Some(legacy) = legacy.as_mut() {
                legacy.push(legacy_digest(data));
            }
        }

        let mut probe = [0u8; 1];
        match reader.read(&mut probe) {
            Ok(0) => {}
            Ok(_) => {
                return Err(FilesError::ChunkingFailed(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "source longer than declared size",
                )));
            }
            Err(e) => return Err(FilesError::ChunkingFailed(e)),
        }

        let tree = MerkleTree::from_leaves(digest, hashes)?;
        debug!(
            name,
            total_size,
            pieces = layout.piece_count(),
            root = %hex::encode(tree.root()),
            "chunked source"
        );
        PieceManifest::new(name, layout, tree, legacy)
    }

    /// Chunk an in-memory buffer.
    ///
    /// # Errors
    ///
    /// See [`Chunker::chunk_reader`].
    pub fn chunk_bytes(&self, name: &str, data: &[u8]) -> Result<PieceManifest> {
        self.chunk_reader(name, data, data.len() as u64)
    }

    /// Chunk a file on disk, named after its final path component.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkingFailed`] if the file cannot be opened
    /// or read.
    pub fn chunk_path(&self, path: &Path) -> Result<PieceManifest> {
        let file = File::open(path).map_err(FilesError::ChunkingFailed)?;
        let total_size = file
            .metadata()
            .map_err(FilesError::ChunkingFailed)?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.chunk_reader(&name, BufReader::new(file), total_size)
    }

    /// Chunk a file on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`Chunker::chunk_path`]; a panicked worker maps to [`FilesError::Task`].
    pub async fn chunk_file(&self, path: impl AsRef<Path>) -> Result<PieceManifest> {
        let chunker = *self;
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || chunker.chunk_path(&path)).await?
    }
}

fn clamp(total_size: u64) -> u32 {
    u32::try_from(total_size).unwrap_or(u32::MAX)
}
