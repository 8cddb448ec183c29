//! Layered merkle trees over piece digests.
//!
//! Layer 0 holds the piece digests in file order. Each following layer
//! hashes adjacent pairs `hash(left ‖ right)`; when a layer has odd length the
//! final node is paired with itself. The root is the single node of the last
//! layer, so `n` leaves give `ceil(log2 n) + 1` layers.
//!
//! Every layer is kept, which is what lets a receiver check one piece against
//! the root with an inclusion proof instead of the whole leaf list.

use crate::digest::PieceDigest;
use crate::error::{FilesError, Result};

/// Full merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    digest: PieceDigest,
    layers: Vec<Vec<[u8; 32]>>,
}

/// Sibling path from one leaf up to the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf index
    pub index: u32,
    /// Sibling at each layer, bottom first
    pub siblings: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// Build a tree from piece digests.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::EmptyTree`] if `leaves` is empty.
    ///
    /// # Example
    ///
    /// ```
    /// use weft_files::{MerkleTree, PieceDigest};
    ///
    /// let leaves = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
    /// let tree = MerkleTree::from_leaves(PieceDigest::Sha256, leaves)?;
    /// assert_eq!(tree.layer_count(), 3);
    /// # Ok::<(), weft_files::FilesError>(())
    /// ```
    pub fn from_leaves(digest: PieceDigest, leaves: Vec<[u8; 32]>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(FilesError::EmptyTree);
        }

        let mut layers = vec![leaves];
        while let Some(current) = layers.last().filter(|l| l.len() > 1) {
            let next: Vec<[u8; 32]> = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    digest.hash_pair(left, right)
                })
                .collect();
            layers.push(next);
        }

        Ok(Self { digest, layers })
    }

    /// Digest used for parents
    #[must_use]
    pub fn digest(&self) -> PieceDigest {
        self.digest
    }

    /// Root hash
    #[must_use]
    pub fn root(&self) -> [u8; 32] {
        // from_leaves guarantees a non-empty final layer
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    /// Number of layers including leaves and root
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// All layers, leaves first
    #[must_use]
    pub fn layers(&self) -> &[Vec<[u8; 32]>] {
        &self.layers
    }

    /// Piece digests
    #[must_use]
    pub fn leaves(&self) -> &[[u8; 32]] {
        &self.layers[0]
    }

    /// Inclusion proof for leaf `index`
    #[must_use]
    pub fn proof(&self, index: u32) -> Option<MerkleProof> {
        let mut pos = index as usize;
        if pos >= self.leaves().len() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.layers.len().saturating_sub(1));
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = pos ^ 1;
            siblings.push(*layer.get(sibling).unwrap_or(&layer[pos]));
            pos /= 2;
        }

        Some(MerkleProof { index, siblings })
    }

    /// Check that `leaf` sits at `proof.index` under `root`
    #[must_use]
    pub fn verify_proof(
        digest: PieceDigest,
        leaf: &[u8; 32],
        proof: &MerkleProof,
        root: &[u8; 32],
    ) -> bool {
        let mut pos = proof.index as usize;
        let mut node = *leaf;
        for sibling in &proof.siblings {
            node = if pos % 2 == 0 {
                digest.hash_pair(&node, sibling)
            } else {
                digest.hash_pair(sibling, &node)
            };
            pos /= 2;
        }
        &node == root
    }
}

/// `ceil(log2 n) + 1`, the layer count for `n` leaves (`n > 0`)
#[must_use]
pub fn expected_layer_count(leaves: usize) -> usize {
    let mut width = leaves.max(1);
    let mut layers = 1;
    while width > 1 {
        width = width.div_ceil(2);
        layers += 1;
    }
    layers
}
