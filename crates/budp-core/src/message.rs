//! Typed frame payloads.
//!
//! Every payload starts with an ASCII tag. Control messages carry their
//! fields as `::`-separated decimal values; application data is carried
//! verbatim after `DATA::`.
//!
//! ```text
//! CONN::<identity>
//! AUTH::<identity>::<ES|NoE>
//! ConnE::<dh_public>
//! ConnNoE
//! ACCEPTED_E::<dh_public>
//! HB
//! DATA::<bytes>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::{split_once, BudpError, BUDP_SEP};

pub const TAG_CONN: &str = "CONN";
pub const TAG_AUTH: &str = "AUTH";
pub const TAG_CONN_E: &str = "ConnE";
pub const TAG_CONN_NO_E: &str = "ConnNoE";
pub const TAG_ACCEPTED_E: &str = "ACCEPTED_E";
pub const TAG_HEARTBEAT: &str = "HB";
pub const TAG_DATA: &str = "DATA";

const CAP_ENCRYPTION: &str = "ES";
const CAP_NO_ENCRYPTION: &str = "NoE";

/// Encryption capability a server advertises in `AUTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Encryption,
    NoEncryption,
}

impl Capability {
    fn as_str(self) -> &'static str {
        match self {
            Capability::Encryption => CAP_ENCRYPTION,
            Capability::NoEncryption => CAP_NO_ENCRYPTION,
        }
    }

    fn parse(field: &[u8]) -> Result<Self, BudpError> {
        match field {
            b"ES" => Ok(Capability::Encryption),
            b"NoE" => Ok(Capability::NoEncryption),
            _ => Err(BudpError::MalformedField("capability")),
        }
    }
}

/// Handshake and liveness messages exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client hello carrying the client's public identity.
    Conn { identity: u64 },
    /// Server reply carrying its public identity and encryption capability.
    Auth { identity: u64, capability: Capability },
    /// Client ephemeral DH public value.
    ConnE { dh_public: u64 },
    /// Client declines encryption.
    ConnNoE,
    /// Server ephemeral DH public value; completes an encrypted handshake.
    AcceptedE { dh_public: u64 },
    /// Keepalive.
    Heartbeat,
}

impl ControlMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Conn { .. } => TAG_CONN,
            ControlMessage::Auth { .. } => TAG_AUTH,
            ControlMessage::ConnE { .. } => TAG_CONN_E,
            ControlMessage::ConnNoE => TAG_CONN_NO_E,
            ControlMessage::AcceptedE { .. } => TAG_ACCEPTED_E,
            ControlMessage::Heartbeat => TAG_HEARTBEAT,
        }
    }
}

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control(ControlMessage),
    Data(Bytes),
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Packet::Control(msg) => {
                buf.put_slice(msg.tag().as_bytes());
                match *msg {
                    ControlMessage::Conn { identity } => put_field(&mut buf, identity),
                    ControlMessage::Auth {
                        identity,
                        capability,
                    } => {
                        put_field(&mut buf, identity);
                        buf.put_slice(BUDP_SEP);
                        buf.put_slice(capability.as_str().as_bytes());
                    }
                    ControlMessage::ConnE { dh_public } => put_field(&mut buf, dh_public),
                    ControlMessage::AcceptedE { dh_public } => put_field(&mut buf, dh_public),
                    ControlMessage::ConnNoE | ControlMessage::Heartbeat => {}
                }
            }
            Packet::Data(data) => {
                buf.reserve(data.len());
                buf.put_slice(TAG_DATA.as_bytes());
                buf.put_slice(BUDP_SEP);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, BudpError> {
        let (tag, rest) = match split_once(&payload) {
            Some((tag, _)) => (tag, Some(payload.slice(tag.len() + BUDP_SEP.len()..))),
            None => (&payload[..], None),
        };

        let msg = match (tag, rest) {
            (b"DATA", Some(data)) => return Ok(Packet::Data(data)),
            (b"CONN", Some(fields)) => ControlMessage::Conn {
                identity: parse_u64(&fields)?,
            },
            (b"AUTH", Some(fields)) => {
                let (identity, capability) =
                    split_once(&fields).ok_or(BudpError::MalformedField("capability"))?;
                ControlMessage::Auth {
                    identity: parse_u64(identity)?,
                    capability: Capability::parse(capability)?,
                }
            }
            (b"ConnE", Some(fields)) => ControlMessage::ConnE {
                dh_public: parse_u64(&fields)?,
            },
            (b"ACCEPTED_E", Some(fields)) => ControlMessage::AcceptedE {
                dh_public: parse_u64(&fields)?,
            },
            (b"ConnNoE", None) => ControlMessage::ConnNoE,
            (b"HB", None) => ControlMessage::Heartbeat,
            _ => {
                return Err(BudpError::UnknownTag(
                    String::from_utf8_lossy(tag).into_owned(),
                ))
            }
        };
        Ok(Packet::Control(msg))
    }
}

impl From<ControlMessage> for Packet {
    fn from(msg: ControlMessage) -> Self {
        Packet::Control(msg)
    }
}

fn put_field(buf: &mut BytesMut, value: u64) {
    buf.put_slice(BUDP_SEP);
    buf.put_slice(value.to_string().as_bytes());
}

fn parse_u64(field: &[u8]) -> Result<u64, BudpError> {
    if field.is_empty() || field.len() > 20 || !field.iter().all(u8::is_ascii_digit) {
        return Err(BudpError::MalformedField("decimal"));
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BudpError::MalformedField("decimal"))
}
