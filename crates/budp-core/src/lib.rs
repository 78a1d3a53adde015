//! Core BUDP protocol types, framing, and constants.
//!
//! This crate provides:
//! - The textual wire frame `<seq>::<checksum>::<payload>`
//! - The 16-bit one's-complement integrity check
//! - Typed control messages and application data payloads

#![forbid(unsafe_code)]

pub mod checksum;
pub mod message;

pub use message::{Capability, ControlMessage, Packet};

use bytes::{BufMut, Bytes, BytesMut};

/// Field separator used by frames and control messages.
pub const BUDP_SEP: &[u8] = b"::";

/// Largest datagram any session will send or accept. Configuration may
/// lower it but never raise it.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BudpError {
    #[error("missing frame separator")]
    MissingSeparator,
    #[error("invalid sequence field")]
    InvalidSequence,
    #[error("invalid checksum field")]
    InvalidChecksumField,
    #[error("checksum mismatch: frame says {expected:04X}, payload sums to {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("unknown payload tag: {0:?}")]
    UnknownTag(String),
    #[error("malformed {0} field")]
    MalformedField(&'static str),
}

/// One datagram on the wire.
///
/// The checksum always covers `payload` exactly as transmitted, i.e. after
/// keystream encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub checksum: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: u32, payload: Bytes) -> Self {
        Self {
            seq,
            checksum: checksum::checksum(&payload),
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let seq = self.seq.to_string();
        let mut buf = BytesMut::with_capacity(seq.len() + 8 + self.payload.len());
        buf.put_slice(seq.as_bytes());
        buf.put_slice(BUDP_SEP);
        buf.put_slice(format!("{:04X}", self.checksum).as_bytes());
        buf.put_slice(BUDP_SEP);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram and verify its checksum.
    ///
    /// Only the first two separators are significant; the payload may
    /// contain anything.
    pub fn decode(bytes: Bytes) -> Result<Self, BudpError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(BudpError::TooLarge(bytes.len()));
        }

        let (seq_field, rest) = split_once(&bytes).ok_or(BudpError::MissingSeparator)?;
        let (csum_field, _) = split_once(rest).ok_or(BudpError::MissingSeparator)?;

        let seq = parse_seq(seq_field)?;
        let expected = parse_checksum(csum_field)?;

        let payload_start = seq_field.len() + csum_field.len() + 2 * BUDP_SEP.len();
        let payload = bytes.slice(payload_start..);

        let actual = checksum::checksum(&payload);
        if actual != expected {
            return Err(BudpError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            seq,
            checksum: expected,
            payload,
        })
    }
}

/// Split at the first separator, returning the parts before and after it.
pub(crate) fn split_once(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes
        .windows(BUDP_SEP.len())
        .position(|window| window == BUDP_SEP)?;
    Some((&bytes[..pos], &bytes[pos + BUDP_SEP.len()..]))
}

fn parse_seq(field: &[u8]) -> Result<u32, BudpError> {
    if field.is_empty() || field.len() > 10 || !field.iter().all(u8::is_ascii_digit) {
        return Err(BudpError::InvalidSequence);
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BudpError::InvalidSequence)
}

fn parse_checksum(field: &[u8]) -> Result<u16, BudpError> {
    if field.len() != 4 || !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(BudpError::InvalidChecksumField);
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or(BudpError::InvalidChecksumField)
}
