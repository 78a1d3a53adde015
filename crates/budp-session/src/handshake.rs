//! Handshake state machine.
//!
//! ```text
//! client                                server
//!   CONN(identity)            ---->
//!                             <----     AUTH(identity, ES|NoE)
//!   [pin check]
//!   ConnE(dh_public)          ---->     [agree] Ready
//!                             <----     ACCEPTED_E(dh_public)
//!   [agree] Ready
//!
//!   or, without encryption:
//!   ConnNoE                   ---->     Ready
//!   Ready
//! ```
//!
//! All handshake messages travel unencrypted.

use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, warn};

use budp_core::{Capability, ControlMessage, Packet};
use budp_crypto::{check_pin, EphemeralKey, PinStatus, PinStore};

use crate::session::{HandshakePhase, Message, Role, Session, SessionState};

/// Pinning context shared by every session of a registry.
pub(crate) struct PinContext<'a> {
    pub store: &'a dyn PinStore,
    pub namespace: &'a str,
}

impl Session {
    /// Dispatch a decoded packet. Returns the event to surface, if any.
    pub(crate) fn on_packet(
        &mut self,
        packet: Packet,
        src: SocketAddr,
        pins: &PinContext<'_>,
        now: Instant,
    ) -> Option<Message> {
        match packet {
            Packet::Data(data) if self.state == SessionState::Ready => {
                Some(Message::Application(data))
            }
            Packet::Data(_) => {
                debug!(handle = self.index, state = ?self.state, "dropping data before ready");
                None
            }
            Packet::Control(ControlMessage::Heartbeat) => None,
            Packet::Control(msg) if self.state == SessionState::Ready => {
                debug!(handle = self.index, tag = msg.tag(), "ignoring control message while ready");
                None
            }
            Packet::Control(msg) => match self.role {
                Role::Server => self.server_control(msg, src, now),
                Role::Client => self.client_control(msg, pins, now),
            },
        }
    }

    fn server_control(
        &mut self,
        msg: ControlMessage,
        src: SocketAddr,
        now: Instant,
    ) -> Option<Message> {
        match msg {
            ControlMessage::Conn { identity } => {
                debug!(handle = self.index, %src, client_identity = identity, "CONN");
                self.clear_crypto();
                self.remote_endpoint = Some(src);
                self.remote_host_label = Some(src.ip().to_string());

                let capability = if self.supports_encryption() {
                    Capability::Encryption
                } else {
                    Capability::NoEncryption
                };
                let reply = ControlMessage::Auth {
                    identity: self.identity.public(),
                    capability,
                };
                self.send_plain(&reply.into(), now);
                None
            }
            _ if self.remote_endpoint != Some(src) => {
                debug!(handle = self.index, %src, tag = msg.tag(), "handshake message before CONN");
                None
            }
            ControlMessage::ConnE { dh_public } => {
                if !self.supports_encryption() {
                    debug!(handle = self.index, "ConnE received but encryption is not offered");
                    return None;
                }

                let ephemeral = EphemeralKey::generate();
                let secret = match ephemeral.agree(dh_public) {
                    Ok(secret) => secret,
                    Err(e) => {
                        debug!(handle = self.index, "rejecting ConnE: {}", e);
                        return None;
                    }
                };

                let reply = ControlMessage::AcceptedE {
                    dh_public: ephemeral.public(),
                };
                self.activate_encryption(secret);
                self.send_plain(&reply.into(), now);
                self.set_ready(now);
                Some(Message::Connected)
            }
            ControlMessage::ConnNoE => {
                if self.encryption_forced() {
                    warn!(handle = self.index, %src, "peer declined required encryption");
                    self.set_dead("encryption required");
                    return Some(Message::EncryptionRequiredButUnavailable);
                }
                self.set_ready(now);
                Some(Message::Connected)
            }
            ControlMessage::Auth { .. } | ControlMessage::AcceptedE { .. } => {
                debug!(handle = self.index, tag = msg.tag(), "client message sent to server");
                None
            }
            ControlMessage::Heartbeat => None,
        }
    }

    fn client_control(
        &mut self,
        msg: ControlMessage,
        pins: &PinContext<'_>,
        now: Instant,
    ) -> Option<Message> {
        if self.state != SessionState::Connecting {
            debug!(handle = self.index, tag = msg.tag(), state = ?self.state, "unexpected control message");
            return None;
        }

        match (self.phase, msg) {
            (
                HandshakePhase::AwaitingAuth,
                ControlMessage::Auth {
                    identity,
                    capability,
                },
            ) => self.on_auth(identity, capability, pins, now),
            (HandshakePhase::AwaitingAccept, ControlMessage::AcceptedE { dh_public }) => {
                let agreed = match self.ephemeral.as_ref() {
                    Some(ephemeral) => ephemeral.agree(dh_public),
                    None => return None,
                };
                match agreed {
                    Ok(secret) => {
                        self.activate_encryption(secret);
                        self.set_ready(now);
                        Some(Message::Connected)
                    }
                    Err(e) => {
                        debug!(handle = self.index, "rejecting ACCEPTED_E: {}", e);
                        None
                    }
                }
            }
            (phase, msg) => {
                debug!(handle = self.index, tag = msg.tag(), ?phase, "ignoring out-of-phase message");
                None
            }
        }
    }

    fn on_auth(
        &mut self,
        server_identity: u64,
        capability: Capability,
        pins: &PinContext<'_>,
        now: Instant,
    ) -> Option<Message> {
        let host = self
            .remote_host_label
            .clone()
            .or_else(|| self.remote_endpoint.map(|addr| addr.ip().to_string()))
            .unwrap_or_default();

        match check_pin(pins.store, pins.namespace, &host, server_identity) {
            Ok(PinStatus::FirstUse) | Ok(PinStatus::Match) => {}
            Ok(PinStatus::Mismatch { pinned, presented }) => {
                warn!(
                    handle = self.index,
                    host = %host,
                    pinned,
                    presented,
                    "server identity changed; possible man-in-the-middle"
                );
                self.set_dead("identity mismatch");
                return Some(Message::MitmDetected);
            }
            Err(e) => {
                error!(handle = self.index, host = %host, "pin store failure: {}", e);
                self.set_dead("pin store failure");
                return Some(Message::Dead);
            }
        }

        if capability == Capability::Encryption && self.wants_encryption() {
            let ephemeral = EphemeralKey::generate();
            let offer = ControlMessage::ConnE {
                dh_public: ephemeral.public(),
            };
            self.ephemeral = Some(ephemeral);
            self.phase = HandshakePhase::AwaitingAccept;
            self.send_plain(&offer.into(), now);
            return None;
        }

        if self.encryption_forced() {
            warn!(handle = self.index, host = %host, ?capability, "encryption required but not negotiable");
            self.set_dead("encryption required");
            return Some(Message::EncryptionRequiredButUnavailable);
        }

        self.send_plain(&ControlMessage::ConnNoE.into(), now);
        self.set_ready(now);
        Some(Message::Connected)
    }
}
