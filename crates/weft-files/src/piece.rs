//! Piece sizing and boundaries.

use serde::{Deserialize, Serialize};

use crate::FIXED_PIECE_SIZE;
use crate::error::{FilesError, Result};

const KIB: u32 = 1024;
const MIB: u64 = 1024 * 1024;

/// How the nominal piece size is chosen for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "size")]
pub enum PieceSizePolicy {
    /// Same size for every file
    Fixed(u32),
    /// Grows with file size, for interoperable piece mode
    Graduated,
}

impl Default for PieceSizePolicy {
    fn default() -> Self {
        PieceSizePolicy::Fixed(FIXED_PIECE_SIZE)
    }
}

impl PieceSizePolicy {
    /// Nominal piece size for a file of `total_size` bytes
    ///
    /// Graduated sizes: 256 KiB under 50 MB, 512 KiB under 500 MB, 1 MiB
    /// under 2 GB, 2 MiB under 8 GB, 4 MiB above.
    #[must_use]
    pub fn piece_size(&self, total_size: u64) -> u32 {
        match *self {
            PieceSizePolicy::Fixed(size) => size,
            PieceSizePolicy::Graduated => {
                if total_size < 50 * MIB {
                    256 * KIB
                } else if total_size < 500 * MIB {
                    512 * KIB
                } else if total_size < 2 * 1024 * MIB {
                    1024 * KIB
                } else if total_size < 8 * 1024 * MIB {
                    2 * 1024 * KIB
                } else {
                    4 * 1024 * KIB
                }
            }
        }
    }

    /// Layout for a file of `total_size` bytes under this policy.
    ///
    /// # Errors
    ///
    /// See [`PieceLayout::new`].
    pub fn layout(&self, total_size: u64) -> Result<PieceLayout> {
        PieceLayout::new(self.piece_size(total_size), total_size)
    }
}

/// One piece of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentPiece {
    /// Position in file order
    pub index: u32,
    /// Length in bytes; only the last piece may be shorter than nominal
    pub size: u32,
}

/// Piece boundaries of a file of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_size: u32,
    total_size: u64,
    piece_count: u32,
}

impl PieceLayout {
    /// Create a layout.
    ///
    /// An empty file has exactly one zero-length piece.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::InvalidPieceSize`] for a zero piece size and
    /// [`FilesError::TooManyPieces`] if the index range would overflow.
    pub fn new(piece_size: u32, total_size: u64) -> Result<Self> {
        if piece_size == 0 {
            return Err(FilesError::InvalidPieceSize(piece_size));
        }
        let count = total_size.div_ceil(u64::from(piece_size)).max(1);
        let piece_count = u32::try_from(count).map_err(|_| FilesError::TooManyPieces {
            total: total_size,
            piece_size,
        })?;
        Ok(Self {
            piece_size,
            total_size,
            piece_count,
        })
    }

    /// Nominal piece size
    #[must_use]
    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// Total content length
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of pieces
    #[must_use]
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Byte offset of a piece within the file
    #[must_use]
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_size)
    }

    /// Length of piece `index`, or `None` if out of range.
    ///
    /// The final piece is `total_size - index * piece_size`.
    #[must_use]
    pub fn piece_len(&self, index: u32) -> Option<u32> {
        if index >= self.piece_count {
            return None;
        }
        let remaining = self.total_size.saturating_sub(self.piece_offset(index));
        Some(remaining.min(u64::from(self.piece_size)) as u32)
    }

    /// All pieces in file order
    pub fn pieces(&self) -> impl Iterator<Item = ContentPiece> + '_ {
        (0..self.piece_count).filter_map(move |index| {
            self.piece_len(index)
                .map(|size| ContentPiece { index, size })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graduated_thresholds() {
        let p = PieceSizePolicy::Graduated;
        assert_eq!(p.piece_size(0), 256 * 1024);
        assert_eq!(p.piece_size(50 * MIB - 1), 256 * 1024);
        assert_eq!(p.piece_size(50 * MIB), 512 * 1024);
        assert_eq!(p.piece_size(500 * MIB), 1024 * 1024);
        assert_eq!(p.piece_size(2 * 1024 * MIB), 2 * 1024 * 1024);
        assert_eq!(p.piece_size(8 * 1024 * MIB), 4 * 1024 * 1024);
        assert_eq!(p.piece_size(100 * 1024 * MIB), 4 * 1024 * 1024);
    }

    #[test]
    fn test_fixed_default_is_five_mib() {
        assert_eq!(PieceSizePolicy::default().piece_size(1), 5 * 1024 * 1024);
    }

    #[test]
    fn test_last_piece_is_remainder() {
        let layout = PieceLayout::new(1024 * 1024, 2 * 1024 * 1024 + 524_288).unwrap();
        let sizes: Vec<u32> = layout.pieces().map(|p| p.size).collect();
        assert_eq!(sizes, vec![1_048_576, 1_048_576, 524_288]);
    }

    #[test]
    fn test_evenly_divisible_last_piece_is_full() {
        let layout = PieceLayout::new(16384, 32768).unwrap();
        assert_eq!(layout.piece_count(), 2);
        assert_eq!(layout.piece_len(1), Some(16384));
        assert_eq!(layout.piece_len(2), None);
    }

    #[test]
    fn test_empty_file_has_one_empty_piece() {
        let layout = PieceLayout::new(16384, 0).unwrap();
        assert_eq!(layout.piece_count(), 1);
        assert_eq!(layout.piece_len(0), Some(0));
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(matches!(
            PieceLayout::new(0, 10),
            Err(FilesError::InvalidPieceSize(0))
        ));
        assert!(matches!(
            PieceLayout::new(1, u64::from(u32::MAX) + 1),
            Err(FilesError::TooManyPieces { .. })
        ));
    }
}
