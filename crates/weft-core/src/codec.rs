//! Binary message codec for data-channel traffic.
//!
//! A message is one reason byte followed by the concatenation of its
//! arguments. The codec knows nothing about payload semantics: each receiver
//! slices the remainder according to the reason it got.
//!
//! Numbers below 256 are written as a single byte, anything larger as an
//! 8-byte little-endian integer. Fixed-width fields (piece indices, offsets)
//! are therefore passed as raw bytes by their callers, not as numbers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::reason::Reason;

/// One argument of an encoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    /// Copied verbatim
    Bytes(&'a [u8]),
    /// Written as UTF-8
    Text(&'a str),
    /// One byte if < 256, otherwise 8 bytes little-endian
    Number(u64),
}

impl Arg<'_> {
    /// Encoded size of this argument
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Arg::Bytes(b) => b.len(),
            Arg::Text(s) => s.len(),
            Arg::Number(n) if *n < 256 => 1,
            Arg::Number(_) => 8,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Arg::Bytes(b) => buf.put_slice(b),
            Arg::Text(s) => buf.put_slice(s.as_bytes()),
            Arg::Number(n) if *n < 256 => buf.put_u8(*n as u8),
            Arg::Number(n) => buf.put_u64_le(*n),
        }
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Text(value)
    }
}

impl From<u64> for Arg<'_> {
    fn from(value: u64) -> Self {
        Arg::Number(value)
    }
}

/// Encode a message as `[reason] ‖ args...`
#[must_use]
pub fn encode(reason: Reason, args: &[Arg<'_>]) -> Bytes {
    let len = 1 + args.iter().map(Arg::encoded_len).sum::<usize>();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(reason.as_u8());
    for arg in args {
        arg.write_to(&mut buf);
    }
    buf.freeze()
}

/// Split a message into its raw tag byte and remainder.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] if the input has no tag byte.
pub fn decode_raw(msg: &[u8]) -> Result<(u8, &[u8])> {
    match msg.split_first() {
        Some((tag, rest)) => Ok((*tag, rest)),
        None => Err(CodecError::Empty),
    }
}

/// Split a message into its [`Reason`] and remainder.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for an empty input and
/// [`CodecError::UnknownReason`] for a tag outside the shared schema.
pub fn decode(msg: &[u8]) -> Result<(Reason, &[u8])> {
    let (tag, rest) = decode_raw(msg)?;
    Ok((Reason::try_from(tag)?, rest))
}

/// Read a payload that consists of exactly one codec number.
///
/// # Errors
///
/// Returns [`CodecError::TooShort`] unless the payload is 1 or 8 bytes.
pub fn decode_number(payload: &[u8]) -> Result<u64> {
    match payload.len() {
        1 => Ok(u64::from(payload[0])),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(payload);
            Ok(u64::from_le_bytes(raw))
        }
        actual => Err(CodecError::TooShort {
            expected: if actual < 1 { 1 } else { 8 },
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_only() {
        let msg = encode(Reason::Ahoy, &[]);
        assert_eq!(&msg[..], &[0]);
        let (reason, rest) = decode(&msg).unwrap();
        assert_eq!(reason, Reason::Ahoy);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_mixed_args() {
        let msg = encode(
            Reason::Report,
            &[Arg::Bytes(&[1, 2, 3]), Arg::Text("hi"), Arg::Number(7)],
        );
        assert_eq!(&msg[..], &[10, 1, 2, 3, b'h', b'i', 7]);
    }

    #[test]
    fn test_number_widths() {
        assert_eq!(&encode(Reason::ConnectionCountCheck, &[Arg::Number(255)])[..], &[4, 255]);

        let wide = encode(Reason::ConnectionCountCheck, &[Arg::Number(256)]);
        assert_eq!(wide.len(), 9);
        assert_eq!(&wide[1..], &256u64.to_le_bytes());

        let (_, rest) = decode(&wide).unwrap();
        assert_eq!(decode_number(rest).unwrap(), 256);
        assert_eq!(decode_number(&[42]).unwrap(), 42);
        assert!(decode_number(&[1, 2]).is_err());
        assert!(decode_number(&[]).is_err());
    }

    #[test]
    fn test_empty_input_is_fatal() {
        assert!(matches!(decode(&[]), Err(CodecError::Empty)));
        assert!(matches!(decode_raw(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_unknown_tag_keeps_raw_access() {
        let (tag, rest) = decode_raw(&[200, 9]).unwrap();
        assert_eq!(tag, 200);
        assert_eq!(rest, &[9]);
        assert!(matches!(decode(&[200, 9]), Err(CodecError::UnknownReason(200))));
    }

    #[test]
    fn test_arg_from_impls() {
        let bytes: &[u8] = b"ab";
        assert_eq!(Arg::from(bytes), Arg::Bytes(b"ab"));
        assert_eq!(Arg::from("x"), Arg::Text("x"));
        assert_eq!(Arg::from(300u64).encoded_len(), 8);
    }
}
