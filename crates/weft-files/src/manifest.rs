//! Piece manifests and the metadata carried by `TorrentInit`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use weft_core::{MAX_MESSAGE_SIZE, RootHash, TorrentInitHeader};

use crate::digest::{LEGACY_DIGEST_SIZE, PieceDigest};
use crate::error::{FilesError, Result};
use crate::merkle::MerkleTree;
use crate::piece::PieceLayout;

/// Value of the `created by` metadata field
pub const CREATED_BY: &str = concat!("weft/", env!("CARGO_PKG_VERSION"));

/// Result of chunking one file
#[derive(Debug, Clone)]
pub struct PieceManifest {
    name: String,
    layout: PieceLayout,
    tree: MerkleTree,
    legacy_hashes: Option<Vec<[u8; LEGACY_DIGEST_SIZE]>>,
}

impl PieceManifest {
    /// Assemble a manifest from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::HeaderMismatch`] if the leaf count disagrees
    /// with the layout.
    pub fn new(
        name: impl Into<String>,
        layout: PieceLayout,
        tree: MerkleTree,
        legacy_hashes: Option<Vec<[u8; LEGACY_DIGEST_SIZE]>>,
    ) -> Result<Self> {
        if tree.leaves().len() != layout.piece_count() as usize {
            return Err(FilesError::HeaderMismatch(format!(
                "{} leaves for {} pieces",
                tree.leaves().len(),
                layout.piece_count()
            )));
        }
        Ok(Self {
            name: name.into(),
            layout,
            tree,
            legacy_hashes,
        })
    }

    /// File name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Piece boundaries
    #[must_use]
    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Merkle tree over the piece digests
    #[must_use]
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Content root
    #[must_use]
    pub fn root(&self) -> RootHash {
        self.tree.root()
    }

    /// Per-piece digests in file order
    #[must_use]
    pub fn piece_hashes(&self) -> &[[u8; 32]] {
        self.tree.leaves()
    }

    /// Per-piece SHA-1 digests, when requested
    #[must_use]
    pub fn legacy_hashes(&self) -> Option<&[[u8; LEGACY_DIGEST_SIZE]]> {
        self.legacy_hashes.as_deref()
    }

    /// Fixed header for `TorrentInit`
    #[must_use]
    pub fn header(&self) -> TorrentInitHeader {
        TorrentInitHeader {
            root: self.root(),
            piece_count: self.layout.piece_count(),
            piece_size: self.layout.piece_size(),
            total_size: self.layout.total_size(),
        }
    }

    /// Metadata describing this manifest
    #[must_use]
    pub fn metadata(&self) -> TorrentMetadata {
        let creation_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        TorrentMetadata {
            name: self.name.clone(),
            length: self.layout.total_size(),
            piece_length: self.layout.piece_size(),
            digest: self.tree.digest(),
            pieces: self.piece_hashes().iter().map(hex::encode).collect(),
            legacy_pieces: self
                .legacy_hashes
                .as_ref()
                .map(|hashes| hashes.iter().map(hex::encode).collect()),
            root: hex::encode(self.root()),
            created_by: CREATED_BY.to_string(),
            creation_date,
        }
    }

    /// Full `TorrentInit` message
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Metadata`] if the metadata cannot be serialized
    /// and [`FilesError::MessageTooLarge`] if the message exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn init_message(&self) -> Result<Bytes> {
        let metadata = serde_json::to_vec(&self.metadata())?;
        let msg = self.header().to_message(&metadata);
        if msg.len() > MAX_MESSAGE_SIZE {
            return Err(FilesError::MessageTooLarge {
                what: "torrent init",
                size: msg.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(msg)
    }
}

/// JSON metadata that follows the `TorrentInit` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentMetadata {
    /// File name
    pub name: String,
    /// Total length in bytes
    pub length: u64,
    /// Nominal piece size
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// Digest used for pieces and merkle parents
    #[serde(default)]
    pub digest: PieceDigest,
    /// Hex piece digests in file order
    pub pieces: Vec<String>,
    /// Hex SHA-1 piece digests
    #[serde(
        rename = "legacy pieces",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_pieces: Option<Vec<String>>,
    /// Hex merkle root
    #[serde(rename = "pieces root")]
    pub root: String,
    /// Producing software
    #[serde(rename = "created by", default)]
    pub created_by: String,
    /// Unix seconds
    #[serde(rename = "creation date", default)]
    pub creation_date: u64,
}

impl TorrentMetadata {
    /// Parse metadata and check it against the header it arrived with.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Metadata`] for malformed JSON and
    /// [`FilesError::HeaderMismatch`] when any field disagrees with `header`.
    pub fn parse_for(header: &TorrentInitHeader, json: &[u8]) -> Result<Self> {
        let metadata: Self = serde_json::from_slice(json)?;
        metadata.check(header)?;
        Ok(metadata)
    }

    fn check(&self, header: &TorrentInitHeader) -> Result<()> {
        let mismatch = |what: &str| Err(FilesError::HeaderMismatch(what.to_string()));

        if self.root != hex::encode(header.root) {
            return mismatch("root");
        }
        if self.length != header.total_size {
            return mismatch("length");
        }
        if self.piece_length != header.piece_size {
            return mismatch("piece length");
        }
        if self.pieces.len() != header.piece_count as usize {
            return mismatch("piece count");
        }
        let layout = PieceLayout::new(header.piece_size, header.total_size)?;
        if layout.piece_count() != header.piece_count {
            return mismatch("layout");
        }
        if let Some(legacy) = &self.legacy_pieces {
            if legacy.len() != self.pieces.len() {
                return mismatch("legacy piece count");
            }
        }
        Ok(())
    }

    /// Decode the hex piece digests.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::HeaderMismatch`] if any entry is not 32 hex bytes.
    pub fn piece_hashes(&self) -> Result<Vec<[u8; 32]>> {
        self.pieces.iter().map(|h| decode_fixed(h)).collect()
    }

    /// Decode the hex legacy digests, if present.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::HeaderMismatch`] if any entry is not 20 hex bytes.
    pub fn legacy_hashes(&self) -> Result<Option<Vec<[u8; LEGACY_DIGEST_SIZE]>>> {
        self.legacy_pieces
            .as_ref()
            .map(|list| list.iter().map(|h| decode_fixed(h)).collect())
            .transpose()
    }
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| FilesError::HeaderMismatch(format!("digest {hex_str}: {e}")))?;
    Ok(out)
}
