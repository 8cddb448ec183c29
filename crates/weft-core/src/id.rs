//! Peer identities.
//!
//! Ids are self-asserted v4 UUIDs. They travel as 16 raw bytes inside binary
//! messages and as hyphenated strings in the JSON control channel. Anything
//! that is not an RFC 4122 UUID, or is the nil UUID, is rejected before the id
//! is trusted for table lookups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::{Uuid, Variant};

use crate::PEER_ID_SIZE;
use crate::error::CodecError;

/// Identity of a hub, worker or client
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random id
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from the first 16 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if fewer than 16 bytes are present and
    /// [`CodecError::InvalidPeerId`] if the bytes are not a usable UUID.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw = bytes.get(..PEER_ID_SIZE).ok_or(CodecError::TooShort {
            expected: PEER_ID_SIZE,
            actual: bytes.len(),
        })?;
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(raw);
        Self::validated(Uuid::from_bytes(id))
    }

    fn validated(uuid: Uuid) -> Result<Self, CodecError> {
        if uuid.is_nil() {
            return Err(CodecError::InvalidPeerId("nil uuid".into()));
        }
        if uuid.get_variant() != Variant::RFC4122 {
            return Err(CodecError::InvalidPeerId(format!(
                "{uuid} is not an RFC 4122 uuid"
            )));
        }
        Ok(Self(uuid))
    }

    /// Raw 16-byte wire form
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        self.0.as_bytes()
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl FromStr for PeerId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|e| CodecError::InvalidPeerId(e.to_string()))?;
        Self::validated(uuid)
    }
}

impl TryFrom<String> for PeerId {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}
