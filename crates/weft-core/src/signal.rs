//! Signaling data and the relay envelope.
//!
//! [`SignalData`] uses the JSON shape browsers already produce for
//! offer/answer/candidate exchange, so the same payload can cross the hub
//! control channel and a relayed data channel unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::PEER_ID_SIZE;
use crate::codec::{Arg, encode};
use crate::error::{CodecError, Result};
use crate::id::PeerId;
use crate::reason::Reason;

/// One trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Data one peer-connection endpoint hands to the other during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    /// Session description offer
    Offer {
        /// SDP body
        sdp: String,
    },
    /// Session description answer
    Answer {
        /// SDP body
        sdp: String,
    },
    /// Trickled candidate
    Candidate {
        /// The candidate itself
        candidate: IceCandidate,
    },
}

impl SignalData {
    /// Offer or answer, as opposed to a trickled candidate
    #[must_use]
    pub fn is_description(&self) -> bool {
        matches!(self, SignalData::Offer { .. } | SignalData::Answer { .. })
    }

    /// Serialize to compact JSON
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `senderId(16) ‖ receiverId(16) ‖ JSON(SignalData)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    /// Peer that produced the signal
    pub sender: PeerId,
    /// Peer the signal is meant for
    pub receiver: PeerId,
    /// The signaling data
    pub signal: SignalData,
}

impl RelayEnvelope {
    /// Create an envelope
    #[must_use]
    pub fn new(sender: PeerId, receiver: PeerId, signal: SignalData) -> Self {
        Self {
            sender,
            receiver,
            signal,
        }
    }

    /// Encode the payload without a reason tag
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the signal cannot be serialized.
    pub fn to_payload(&self) -> Result<Bytes> {
        let json = self.signal.to_json()?;
        let mut buf = BytesMut::with_capacity(2 * PEER_ID_SIZE + json.len());
        buf.put_slice(self.sender.as_bytes());
        buf.put_slice(self.receiver.as_bytes());
        buf.put_slice(json.as_bytes());
        Ok(buf.freeze())
    }

    /// Encode as a full message with the given reason (`RelaySignal` or `Signal`)
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the signal cannot be serialized.
    pub fn to_message(&self, reason: Reason) -> Result<Bytes> {
        let json = self.signal.to_json()?;
        Ok(encode(
            reason,
            &[
                Arg::Bytes(self.sender.as_bytes()),
                Arg::Bytes(self.receiver.as_bytes()),
                Arg::Text(&json),
            ],
        ))
    }

    /// Parse a payload (the bytes after the reason tag).
    ///
    /// Both ids are validated before the JSON body is looked at.
    ///
    /// # Errors
    ///
    /// Returns an error for short payloads, invalid ids, or malformed JSON.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 * PEER_ID_SIZE {
            return Err(CodecError::TooShort {
                expected: 2 * PEER_ID_SIZE,
                actual: payload.len(),
            });
        }
        let sender = PeerId::from_slice(&payload[..PEER_ID_SIZE])?;
        let receiver = PeerId::from_slice(&payload[PEER_ID_SIZE..2 * PEER_ID_SIZE])?;
        let body = std::str::from_utf8(&payload[2 * PEER_ID_SIZE..])?;
        let signal = serde_json::from_str(body)?;
        Ok(Self {
            sender,
            receiver,
            signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    fn candidate() -> SignalData {
        SignalData::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }
    }

    #[test]
    fn test_browser_json_shape() {
        let offer = SignalData::Offer { sdp: "v=0".into() };
        assert_eq!(offer.to_json().unwrap(), r#"{"type":"offer","sdp":"v=0"}"#);

        let json = candidate().to_json().unwrap();
        assert!(json.contains(r#""type":"candidate""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(json.contains(r#""sdpMid":"0""#));
    }

    #[test]
    fn test_parse_candidate_without_optional_fields() {
        let json = r#"{"type":"candidate","candidate":{"candidate":"c"}}"#;
        let parsed: SignalData = serde_json::from_str(json).unwrap();
        assert!(!parsed.is_description());
    }

    #[test]
    fn test_envelope_layout() {
        let sender = PeerId::random();
        let receiver = PeerId::random();
        let env = RelayEnvelope::new(sender, receiver, candidate());

        let msg = env.to_message(Reason::RelaySignal).unwrap();
        let (reason, payload) = decode(&msg).unwrap();
        assert_eq!(reason, Reason::RelaySignal);
        assert_eq!(&payload[..16], sender.as_bytes());
        assert_eq!(&payload[16..32], receiver.as_bytes());
        assert_eq!(payload, &env.to_payload().unwrap()[..]);

        let parsed = RelayEnvelope::parse(payload).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_envelope_rejects_bad_ids() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(br#"{"type":"offer","sdp":"x"}"#);
        assert!(matches!(
            RelayEnvelope::parse(&payload),
            Err(CodecError::InvalidPeerId(_))
        ));
        assert!(matches!(
            RelayEnvelope::parse(&[1, 2, 3]),
            Err(CodecError::TooShort { .. })
        ));
    }

    #[test]
    fn test_envelope_rejects_bad_json() {
        let mut payload = PeerId::random().as_bytes().to_vec();
        payload.extend_from_slice(PeerId::random().as_bytes());
        payload.extend_from_slice(b"{not json");
        assert!(matches!(
            RelayEnvelope::parse(&payload),
            Err(CodecError::Json(_))
        ));
    }
}
