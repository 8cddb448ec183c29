//! Error types for the mesh layer
//!
//! Most failures here are local to one peer: a bad message is dropped, a
//! failed link closes that peer only. The variants that reach callers are
//! the ones a command can fail with.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (socket errors, timeouts, a rejected
//!   registration that will be retried with a new id)
//! - **Permanent**: will not succeed without intervention (unknown peer, node
//!   stopped, bootstrap attempts exhausted)

use std::borrow::Cow;

use thiserror::Error;
use weft_core::{CodecError, PeerId};
use weft_files::FilesError;

/// Result alias for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Mesh layer errors
#[derive(Debug, Error)]
pub enum MeshError {
    // ============ Wire Errors ============
    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Control-channel JSON could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ============ Transport Errors ============
    /// WebSocket failure on the hub control channel
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Peer connection failure
    #[error("Link error: {0}")]
    Link(Cow<'static, str>),

    /// Socket or filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Peer Errors ============
    /// No connected peer with this id
    #[error("Peer not connected: {0}")]
    PeerNotFound(PeerId),

    /// Command is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Registration Errors ============
    /// Hub refused the registration (id collision or missing id)
    #[error("Registration rejected by hub")]
    RegistrationRejected,

    /// Every bootstrap attempt failed
    #[error("Bootstrap failed after {attempts} attempts")]
    BootstrapExhausted {
        /// Attempts made
        attempts: u32,
    },

    // ============ Transfer Errors ============
    /// Chunking, reassembly or storage failed
    #[error("Transfer error: {0}")]
    Files(#[from] FilesError),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Node actor is no longer running
    #[error("Node stopped")]
    NodeStopped,
}

impl From<tokio_tungstenite::tungstenite::Error> for MeshError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MeshError::WebSocket(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeshError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeshError::NodeStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MeshError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MeshError::NodeStopped
    }
}

impl MeshError {
    /// Check if this error is transient (may succeed on retry)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::WebSocket(_)
                | MeshError::Link(_)
                | MeshError::Io(_)
                | MeshError::RegistrationRejected
                | MeshError::Timeout(_)
        )
    }

    /// Create a link error from a static message
    #[must_use]
    pub const fn link(msg: &'static str) -> Self {
        MeshError::Link(Cow::Borrowed(msg))
    }

    /// Create an invalid-state error from a static message
    #[must_use]
    pub const fn invalid_state(msg: &'static str) -> Self {
        MeshError::InvalidState(Cow::Borrowed(msg))
    }

    /// Create a timeout error from a static message
    #[must_use]
    pub const fn timeout(msg: &'static str) -> Self {
        MeshError::Timeout(Cow::Borrowed(msg))
    }
}
