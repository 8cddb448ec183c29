//! # WEFT Core
//!
//! Wire schema shared by every WEFT endpoint: hubs, workers and clients all
//! compile against this crate, so reason tags and payload layouts cannot drift
//! between deployments.
//!
//! This crate provides:
//! - The [`Reason`] tag enum carried in the first byte of every data-channel message
//! - The binary message codec ([`codec::encode`] / [`codec::decode`])
//! - Peer identities ([`PeerId`]) and the relay signaling envelope
//! - JSON control-channel messages exchanged with the hub
//! - Fixed-width headers for the piece transfer protocol
//!
//! ## Message layout
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────────────┐
//! │ reason │ args (raw bytes | UTF-8 | u8 or u64 LE numbers)      │
//! │  (1)   │ reason-specific layout, see `frame` and `signal`     │
//! └────────┴──────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod id;
pub mod reason;
pub mod signal;

pub use codec::{Arg, decode, decode_raw, encode};
pub use control::{ControlReply, ControlRequest, Role};
pub use error::{CodecError, Result};
pub use frame::{
    DownloadResponse, PieceAck, PieceChunkHeader, RootHash, TorrentInitHeader, UploadIntent,
    UploadResponse,
};
pub use id::PeerId;
pub use reason::Reason;
pub use signal::{IceCandidate, RelayEnvelope, SignalData};

/// Size of a peer id on the wire (raw UUID bytes)
pub const PEER_ID_SIZE: usize = 16;

/// Size of a content root hash
pub const ROOT_HASH_SIZE: usize = 32;

/// Size of the fixed `PieceChunk` header: root hash, piece index, byte offset
pub const PIECE_CHUNK_HEADER_SIZE: usize = ROOT_HASH_SIZE + 4 + 4;

/// Size of the fixed `TorrentInit` header: root hash, piece count, piece size, total size
pub const TORRENT_INIT_HEADER_SIZE: usize = ROOT_HASH_SIZE + 4 + 4 + 8;

/// Largest message a data channel carries in one send.
///
/// SCTP in webrtc-rs refuses bigger messages. `TorrentInit` carries every
/// piece digest in one message, which caps a transfer at roughly 900
/// SHA-256 pieces; raise the piece size for larger files.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
