//! Fixed-width headers for the piece transfer protocol.
//!
//! All multi-byte integers are little-endian, matching the codec's wide
//! number encoding. Each header is written as raw bytes after the reason
//! tag; parsers take the payload that follows the tag.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};
use crate::reason::Reason;
use crate::{PIECE_CHUNK_HEADER_SIZE, ROOT_HASH_SIZE, TORRENT_INIT_HEADER_SIZE};

/// Merkle root that names a piece of content
pub type RootHash = [u8; ROOT_HASH_SIZE];

fn need(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() < expected {
        return Err(CodecError::TooShort {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_root(payload: &[u8]) -> RootHash {
    let mut root = [0u8; ROOT_HASH_SIZE];
    root.copy_from_slice(&payload[..ROOT_HASH_SIZE]);
    root
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(payload: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn message(reason: Reason, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + capacity);
    buf.put_u8(reason.as_u8());
    buf
}

/// Split a root hash off the front of a payload.
///
/// # Errors
///
/// Returns [`CodecError::TooShort`] if fewer than 32 bytes are present.
pub fn split_root(payload: &[u8]) -> Result<(RootHash, &[u8])> {
    need(payload, ROOT_HASH_SIZE)?;
    Ok((read_root(payload), &payload[ROOT_HASH_SIZE..]))
}

/// Build a message whose payload is a root hash followed by `tail`
#[must_use]
pub fn root_message(reason: Reason, root: &RootHash, tail: &[u8]) -> Bytes {
    let mut buf = message(reason, ROOT_HASH_SIZE + tail.len());
    buf.put_slice(root);
    buf.put_slice(tail);
    buf.freeze()
}

/// `rootHash(32) ‖ pieceCount(u32) ‖ pieceSize(u32) ‖ totalSize(u64)`, then metadata JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorrentInitHeader {
    /// Content root
    pub root: RootHash,
    /// Number of pieces
    pub piece_count: u32,
    /// Nominal piece size
    pub piece_size: u32,
    /// Total content length
    pub total_size: u64,
}

impl TorrentInitHeader {
    /// Parse the header and return the metadata bytes that follow it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if the payload is under 48 bytes.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8])> {
        need(payload, TORRENT_INIT_HEADER_SIZE)?;
        let header = Self {
            root: read_root(payload),
            piece_count: read_u32(payload, ROOT_HASH_SIZE),
            piece_size: read_u32(payload, ROOT_HASH_SIZE + 4),
            total_size: read_u64(payload, ROOT_HASH_SIZE + 8),
        };
        Ok((header, &payload[TORRENT_INIT_HEADER_SIZE..]))
    }

    /// Encode as a full `TorrentInit` message carrying `metadata`
    #[must_use]
    pub fn to_message(&self, metadata: &[u8]) -> Bytes {
        let mut buf = message(Reason::TorrentInit, TORRENT_INIT_HEADER_SIZE + metadata.len());
        buf.put_slice(&self.root);
        buf.put_u32_le(self.piece_count);
        buf.put_u32_le(self.piece_size);
        buf.put_u64_le(self.total_size);
        buf.put_slice(metadata);
        buf.freeze()
    }
}

/// `rootHash(32) ‖ pieceIndex(u32) ‖ byteOffset(u32)`, then chunk bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceChunkHeader {
    /// Content root
    pub root: RootHash,
    /// Piece the chunk belongs to
    pub index: u32,
    /// Offset of the chunk within its piece
    pub offset: u32,
}

impl PieceChunkHeader {
    /// Parse the header and return the chunk bytes that follow it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if the payload is under 40 bytes.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8])> {
        need(payload, PIECE_CHUNK_HEADER_SIZE)?;
        let header = Self {
            root: read_root(payload),
            index: read_u32(payload, ROOT_HASH_SIZE),
            offset: read_u32(payload, ROOT_HASH_SIZE + 4),
        };
        Ok((header, &payload[PIECE_CHUNK_HEADER_SIZE..]))
    }

    /// Encode as a full `PieceChunk` message carrying `chunk`
    #[must_use]
    pub fn to_message(&self, chunk: &[u8]) -> Bytes {
        let mut buf = message(Reason::PieceChunk, PIECE_CHUNK_HEADER_SIZE + chunk.len());
        buf.put_slice(&self.root);
        buf.put_u32_le(self.index);
        buf.put_u32_le(self.offset);
        buf.put_slice(chunk);
        buf.freeze()
    }
}

/// `rootHash(32) ‖ pieceIndex(u32)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceAck {
    /// Content root
    pub root: RootHash,
    /// Completed piece
    pub index: u32,
}

impl PieceAck {
    /// Parse an ack payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if the payload is under 36 bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        need(payload, ROOT_HASH_SIZE + 4)?;
        Ok(Self {
            root: read_root(payload),
            index: read_u32(payload, ROOT_HASH_SIZE),
        })
    }

    /// Encode as a full `PieceAck` message
    #[must_use]
    pub fn to_message(&self) -> Bytes {
        root_message(Reason::PieceAck, &self.root, &self.index.to_le_bytes())
    }
}

/// `rootHash(32) ‖ JSON{name, size}`, offered before an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadIntent {
    /// Content root
    #[serde(skip)]
    pub root: RootHash,
    /// File name
    pub name: String,
    /// Total content length
    pub size: u64,
}

impl UploadIntent {
    /// Parse an intent payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] without a root and
    /// [`CodecError::Json`] for a malformed body.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (root, body) = split_root(payload)?;
        let mut intent: Self = serde_json::from_slice(body)?;
        intent.root = root;
        Ok(intent)
    }

    /// Encode as a full `Upload` message
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the body cannot be serialized.
    pub fn to_message(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        Ok(root_message(Reason::Upload, &self.root, &body))
    }
}

/// `rootHash(32) ‖ accepted(1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResponse {
    /// Content root
    pub root: RootHash,
    /// Receiver wants the content
    pub accepted: bool,
}

impl UploadResponse {
    /// Parse a response payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if the payload is under 33 bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        need(payload, ROOT_HASH_SIZE + 1)?;
        Ok(Self {
            root: read_root(payload),
            accepted: payload[ROOT_HASH_SIZE] != 0,
        })
    }

    /// Encode as a full `UploadResponse` message
    #[must_use]
    pub fn to_message(&self) -> Bytes {
        root_message(
            Reason::UploadResponse,
            &self.root,
            &[u8::from(self.accepted)],
        )
    }
}

/// `rootHash(32) ‖ found(1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResponse {
    /// Content root
    pub root: RootHash,
    /// Responder holds the content and will stream it
    pub found: bool,
}

impl DownloadResponse {
    /// Parse a response payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if the payload is under 33 bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        need(payload, ROOT_HASH_SIZE + 1)?;
        Ok(Self {
            root: read_root(payload),
            found: payload[ROOT_HASH_SIZE] != 0,
        })
    }

    /// Encode as a full `DownloadResponse` message
    #[must_use]
    pub fn to_message(&self) -> Bytes {
        root_message(
            Reason::DownloadResponse,
            &self.root,
            &[u8::from(self.found)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    #[test]
    fn test_piece_chunk_header_is_40_bytes() {
        let header = PieceChunkHeader {
            root: [7u8; 32],
            index: 3,
            offset: 16384,
        };
        let msg = header.to_message(b"data");
        assert_eq!(msg.len(), 1 + 40 + 4);

        let (reason, payload) = decode(&msg).unwrap();
        assert_eq!(reason, Reason::PieceChunk);
        assert_eq!(&payload[32..36], &3u32.to_le_bytes());
        assert_eq!(&payload[36..40], &16384u32.to_le_bytes());

        let (parsed, chunk) = PieceChunkHeader::parse(payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(chunk, b"data");
    }

    #[test]
    fn test_truncated_headers() {
        assert!(matches!(
            PieceChunkHeader::parse(&[0u8; 39]),
            Err(CodecError::TooShort {
                expected: 40,
                actual: 39
            })
        ));
        assert!(TorrentInitHeader::parse(&[0u8; 47]).is_err());
        assert!(PieceAck::parse(&[0u8; 35]).is_err());
        assert!(UploadResponse::parse(&[0u8; 32]).is_err());
        assert!(split_root(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_torrent_init_carries_metadata() {
        let header = TorrentInitHeader {
            root: [1u8; 32],
            piece_count: 2,
            piece_size: 16384,
            total_size: 24576,
        };
        let msg = header.to_message(br#"{"name":"a"}"#);
        let (reason, payload) = decode(&msg).unwrap();
        assert_eq!(reason, Reason::TorrentInit);
        let (parsed, meta) = TorrentInitHeader::parse(payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(meta, br#"{"name":"a"}"#);
    }

    #[test]
    fn test_small_responses() {
        let ack = PieceAck {
            root: [9u8; 32],
            index: 70000,
        };
        let msg = ack.to_message();
        assert_eq!(PieceAck::parse(&msg[1..]).unwrap(), ack);

        let up = UploadResponse {
            root: [2u8; 32],
            accepted: false,
        };
        assert_eq!(UploadResponse::parse(&up.to_message()[1..]).unwrap(), up);

        let down = DownloadResponse {
            root: [3u8; 32],
            found: true,
        };
        assert_eq!(
            DownloadResponse::parse(&down.to_message()[1..]).unwrap(),
            down
        );
    }

    #[test]
    fn test_upload_intent_layout() {
        let intent = UploadIntent {
            root: [3u8; 32],
            name: "notes.txt".into(),
            size: 42,
        };
        let msg = intent.to_message().unwrap();
        let (reason, payload) = decode(&msg).unwrap();
        assert_eq!(reason, Reason::Upload);
        assert_eq!(&payload[..32], &[3u8; 32]);
        assert_eq!(&payload[32..], br#"{"name":"notes.txt","size":42}"#);
        assert_eq!(UploadIntent::parse(payload).unwrap(), intent);
        assert!(UploadIntent::parse(&payload[..32]).is_err());
    }

    mod parsers {
        use super::*;
        use crate::signal::RelayEnvelope;
        use proptest::prelude::*;

        proptest! {
            /// Untrusted payloads are rejected, never panicked on
            #[test]
            fn arbitrary_payloads_do_not_panic(payload in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = TorrentInitHeader::parse(&payload);
                let _ = PieceChunkHeader::parse(&payload);
                let _ = PieceAck::parse(&payload);
                let _ = UploadIntent::parse(&payload);
                let _ = UploadResponse::parse(&payload);
                let _ = DownloadResponse::parse(&payload);
                let _ = RelayEnvelope::parse(&payload);
                let _ = decode(&payload);
            }

            /// Piece chunk headers keep index and offset in their fixed slots
            #[test]
            fn piece_chunk_header_fields(
                root in any::<[u8; 32]>(),
                index in any::<u32>(),
                offset in any::<u32>(),
                chunk in prop::collection::vec(any::<u8>(), 0..64),
            ) {
                let msg = PieceChunkHeader { root, index, offset }.to_message(&chunk);
                prop_assert_eq!(msg.len(), 1 + PIECE_CHUNK_HEADER_SIZE + chunk.len());
                let (header, rest) = PieceChunkHeader::parse(&msg[1..]).unwrap();
                prop_assert_eq!((header.index, header.offset), (index, offset));
                prop_assert_eq!(rest, &chunk[..]);
            }
        }
    }
}
