//! Reason tags carried in the first byte of every data-channel message.
//!
//! The numbering here is the single source of truth for a deployment. Hubs,
//! workers and clients built from different revisions of this enum cannot talk
//! to each other; that is a deployment error, not something to negotiate at
//! runtime.

use crate::error::CodecError;

/// Data-channel message reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reason {
    /// Handshake acknowledgment sent once a data channel opens
    Ahoy = 0,
    /// Hub asks a worker to start negotiating with a client
    ConnectionInitiation = 1,
    /// Signaling data handed to a relay for forwarding
    RelaySignal = 2,
    /// Signaling data delivered to its final recipient
    Signal = 3,
    /// Worker reports its live connection count to the hub
    ConnectionCountCheck = 4,
    /// Upload intent for a root hash
    Upload = 5,
    /// Receiver accepts or declines an upload
    UploadResponse = 6,
    /// Request content by root hash
    Download = 7,
    /// Whether requested content exists
    DownloadResponse = 8,
    /// Points the requester at another peer
    Redirection = 9,
    /// Free-form diagnostic text
    Report = 10,
    /// Opens a transfer session for a root hash
    TorrentInit = 11,
    /// One sub-chunk of a piece
    PieceChunk = 12,
    /// Receiver confirms a completed piece
    PieceAck = 13,
}

impl Reason {
    /// Every reason in tag order
    pub const ALL: [Reason; 14] = [
        Reason::Ahoy,
        Reason::ConnectionInitiation,
        Reason::RelaySignal,
        Reason::Signal,
        Reason::ConnectionCountCheck,
        Reason::Upload,
        Reason::UploadResponse,
        Reason::Download,
        Reason::DownloadResponse,
        Reason::Redirection,
        Reason::Report,
        Reason::TorrentInit,
        Reason::PieceChunk,
        Reason::PieceAck,
    ];

    /// Raw tag byte
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this reason belongs to connection setup rather than data transfer
    #[must_use]
    pub fn is_signaling(self) -> bool {
        matches!(
            self,
            Reason::Ahoy
                | Reason::ConnectionInitiation
                | Reason::RelaySignal
                | Reason::Signal
                | Reason::ConnectionCountCheck
        )
    }
}

impl TryFrom<u8> for Reason {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(CodecError::UnknownReason(value))
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_match_positions() {
        for (i, reason) in Reason::ALL.iter().enumerate() {
            assert_eq!(reason.as_u8() as usize, i);
            assert_eq!(Reason::try_from(i as u8).unwrap(), *reason);
        }
    }

    #[test]
    fn test_fixed_numbering() {
        assert_eq!(Reason::Ahoy.as_u8(), 0);
        assert_eq!(Reason::Signal.as_u8(), 3);
        assert_eq!(Reason::TorrentInit.as_u8(), 11);
        assert_eq!(Reason::PieceChunk.as_u8(), 12);
        assert_eq!(Reason::PieceAck.as_u8(), 13);
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            Reason::try_from(14),
            Err(CodecError::UnknownReason(14))
        ));
        assert!(Reason::try_from(255).is_err());
    }

    #[test]
    fn test_signaling_split() {
        assert!(Reason::RelaySignal.is_signaling());
        assert!(!Reason::PieceChunk.is_signaling());
    }
}
