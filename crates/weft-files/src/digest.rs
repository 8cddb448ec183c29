//! Piece digests.
//!
//! SHA-256 is the default because browsers can compute it natively, which
//! keeps roots interoperable with web clients. BLAKE3 is available for
//! worker-to-worker content where both ends are native. SHA-1 is only ever a
//! secondary, legacy digest.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Size of a legacy SHA-1 digest
pub const LEGACY_DIGEST_SIZE: usize = 20;

/// Collision-resistant digest used for pieces and merkle parents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceDigest {
    /// SHA-256
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

impl PieceDigest {
    /// Hash one buffer
    #[must_use]
    pub fn hash(self, data: &[u8]) -> [u8; 32] {
        match self {
            PieceDigest::Sha256 => Sha256::digest(data).into(),
            PieceDigest::Blake3 => *blake3::hash(data).as_bytes(),
        }
    }

    /// Hash `left ‖ right`
    #[must_use]
    pub fn hash_pair(self, left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        match self {
            PieceDigest::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            }
            PieceDigest::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(left);
                hasher.update(right);
                *hasher.finalize().as_bytes()
            }
        }
    }
}

impl std::str::FromStr for PieceDigest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(PieceDigest::Sha256),
            "blake3" => Ok(PieceDigest::Blake3),
            other => Err(format!("unknown digest: {other}")),
        }
    }
}

/// SHA-1 of a piece, for external piece-verification ecosystems
#[must_use]
pub fn legacy_digest(data: &[u8]) -> [u8; LEGACY_DIGEST_SIZE] {
    Sha1::digest(data).into()
}
