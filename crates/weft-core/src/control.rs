//! JSON messages on the hub control channel.
//!
//! The control channel only lives until a node's first data channel is up.
//! It carries registration and the signaling for that first connection.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::PeerId;
use crate::signal::SignalData;

/// Role a node plays in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Rendezvous hub
    Hub,
    /// Always-on headless node that serves clients
    Worker,
    /// Short-lived node, typically a browser
    Client,
}

impl Role {
    /// Role implied by the `worker` flag of a register request
    #[must_use]
    pub fn from_worker_flag(worker: bool) -> Self {
        if worker { Role::Worker } else { Role::Client }
    }
}

/// Node → hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "lowercase")]
pub enum ControlRequest {
    /// Claim an id
    Register {
        /// Candidate id; absent ids are rejected
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<PeerId>,
        /// Registering as a worker rather than a client
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        worker: bool,
    },
    /// Signaling data for the hub's side of the first connection
    Signal {
        /// Offer, answer or candidate
        #[serde(rename = "iceData")]
        ice_data: SignalData,
    },
    /// Informational: the node's first data channel is up
    Ahoy,
}

/// Hub → node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "lowercase")]
pub enum ControlReply {
    /// Outcome of a register request; `id` is the hub's own id
    Register {
        /// Hub id the node should connect to
        id: PeerId,
        /// Whether the claimed id was accepted
        success: bool,
    },
    /// Signaling data from the hub's side
    Signal {
        /// Offer, answer or candidate
        #[serde(rename = "iceData")]
        ice_data: SignalData,
    },
}

impl ControlRequest {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::CodecError::Json`] for malformed frames, including
    /// register requests with a malformed id.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::CodecError::Json`] if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ControlReply {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::CodecError::Json`] for malformed frames.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::CodecError::Json`] if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_shapes() {
        let id = PeerId::random();
        let text = format!(r#"{{"reason":"register","id":"{id}"}}"#);
        assert_eq!(
            ControlRequest::parse(&text).unwrap(),
            ControlRequest::Register {
                id: Some(id),
                worker: false
            }
        );

        let text = format!(r#"{{"reason":"register","id":"{id}","worker":true}}"#);
        assert!(matches!(
            ControlRequest::parse(&text).unwrap(),
            ControlRequest::Register { worker: true, .. }
        ));

        assert_eq!(
            ControlRequest::parse(r#"{"reason":"register"}"#).unwrap(),
            ControlRequest::Register {
                id: None,
                worker: false
            }
        );
    }

    #[test]
    fn test_malformed_id_fails_parse() {
        assert!(ControlRequest::parse(r#"{"reason":"register","id":"nope"}"#).is_err());
    }

    #[test]
    fn test_reply_shape() {
        let id = PeerId::random();
        let text = ControlReply::Register { id, success: true }.to_text().unwrap();
        assert_eq!(
            text,
            format!(r#"{{"reason":"register","id":"{id}","success":true}}"#)
        );
    }

    #[test]
    fn test_signal_roundtrip() {
        let req = ControlRequest::Signal {
            ice_data: SignalData::Offer { sdp: "v=0".into() },
        };
        let text = req.to_text().unwrap();
        assert!(text.contains(r#""iceData":{"type":"offer""#));
        assert_eq!(ControlRequest::parse(&text).unwrap(), req);
        assert_eq!(
            ControlRequest::parse(r#"{"reason":"ahoy"}"#).unwrap(),
            ControlRequest::Ahoy
        );
    }

    #[test]
    fn test_role_from_flag() {
        assert_eq!(Role::from_worker_flag(true), Role::Worker);
        assert_eq!(Role::from_worker_flag(false), Role::Client);
    }
}
