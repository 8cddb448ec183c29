//! Error types for the WEFT wire schema.

use thiserror::Error;

/// Result alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while decoding data-channel or control-channel messages
#[derive(Debug, Error)]
pub enum CodecError {
    /// Message is empty and carries no reason tag
    #[error("empty message: no reason tag")]
    Empty,

    /// Message or header shorter than its fixed layout
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Reason tag not present in the shared schema
    #[error("unknown reason tag: {0}")]
    UnknownReason(u8),

    /// Peer id bytes do not form a usable UUID
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Text argument is not valid UTF-8
    #[error("invalid utf-8 payload: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON payload could not be parsed or produced
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),
}
