//! Per-slot session state and the frame send/receive path.

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use budp_common::BudpConfig;
use budp_core::{Frame, Packet};
use budp_crypto::{keystream, EphemeralKey, LocalIdentity, SharedSecret};

use crate::liveness::Liveness;
use crate::transport::Transport;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Ready,
    /// Terminal until `reset`.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

bitflags! {
    /// Encryption policy and status of a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncryptionFlags: u8 {
        /// This side can run the key exchange.
        const LOCALLY_SUPPORTS = 0b0000_0001;
        /// This side asks for encryption when the peer offers it.
        const PEER_REQUESTS = 0b0000_0010;
        /// Abort rather than run unencrypted.
        const FORCE_REQUIRED = 0b0000_0100;
        /// Never negotiate encryption.
        const FORCE_DISABLED = 0b0000_1000;
        /// A shared secret exists and payloads are keystream-encrypted.
        const ACTIVE = 0b0001_0000;
    }
}

impl Default for EncryptionFlags {
    fn default() -> Self {
        EncryptionFlags::LOCALLY_SUPPORTS
    }
}

/// Event surfaced by `update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake completed; the session is `Ready`.
    Connected,
    /// Liveness timeout or an unrecoverable local failure.
    Dead,
    /// The server presented an identity different from the pinned one.
    MitmDetected,
    /// Encryption was required but the peer could not provide it.
    EncryptionRequiredButUnavailable,
    Application(Bytes),
}

/// Client progress through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakePhase {
    None,
    AwaitingAuth,
    AwaitingAccept,
}

/// Result of one receive attempt.
pub(crate) enum Inbound {
    Nothing,
    Dropped,
    Packet(Packet, SocketAddr),
}

pub(crate) struct Session {
    pub(crate) index: usize,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) state: SessionState,
    pub(crate) role: Role,
    pub(crate) remote_endpoint: Option<SocketAddr>,
    pub(crate) remote_host_label: Option<String>,
    pub(crate) seq_out: u32,
    pub(crate) seq_in_expected: u32,
    pub(crate) encryption: EncryptionFlags,
    pub(crate) identity: LocalIdentity,
    pub(crate) ephemeral: Option<EphemeralKey>,
    pub(crate) shared_secret: Option<SharedSecret>,
    pub(crate) phase: HandshakePhase,
    pub(crate) liveness: Liveness,
    initial_sequence: u32,
    heartbeat_timeout: Duration,
    heartbeat_interval: Duration,
    max_datagram_bytes: usize,
    /// Allocated on the first receive after `open`, freed by `close`.
    recv_buf: Vec<u8>,
}

impl Session {
    pub(crate) fn new(index: usize, identity: LocalIdentity, config: &BudpConfig) -> Self {
        let now = Instant::now();
        Self {
            index,
            transport: None,
            state: SessionState::Idle,
            role: Role::Client,
            remote_endpoint: None,
            remote_host_label: None,
            seq_out: config.initial_sequence,
            seq_in_expected: 0,
            encryption: EncryptionFlags::default(),
            identity,
            ephemeral: None,
            shared_secret: None,
            phase: HandshakePhase::None,
            liveness: Liveness::new(config.heartbeat_timeout(), config.heartbeat_interval(), now),
            initial_sequence: config.initial_sequence,
            heartbeat_timeout: config.heartbeat_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_datagram_bytes: config.max_datagram_bytes,
            recv_buf: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Install a transport, discarding the connection the slot held before.
    /// Encryption policy and the heartbeat setting carry over.
    pub(crate) fn install(&mut self, transport: Box<dyn Transport>, role: Role) {
        self.release(Instant::now());
        self.transport = Some(transport);
        self.role = role;
    }

    /// Release the transport and return the slot to its unopened state.
    /// The local identity survives.
    pub(crate) fn shutdown(&mut self) {
        self.release(Instant::now());
        self.recv_buf = Vec::new();
        self.encryption = EncryptionFlags::default();
        self.liveness = Liveness::new(
            self.heartbeat_timeout,
            self.heartbeat_interval,
            Instant::now(),
        );
    }

    fn release(&mut self, now: Instant) {
        self.transport = None;
        self.reset();
        self.role = Role::Client;
        self.remote_endpoint = None;
        self.remote_host_label = None;
        self.seq_out = self.initial_sequence;
        self.liveness.restart(now);
    }

    /// Back to `Idle` for a fresh handshake. Keeps the transport and the
    /// remote endpoint.
    pub(crate) fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.seq_in_expected = 0;
        self.clear_crypto();
    }

    pub(crate) fn clear_crypto(&mut self) {
        self.ephemeral = None;
        self.shared_secret = None;
        self.encryption.remove(EncryptionFlags::ACTIVE);
        self.phase = HandshakePhase::None;
    }

    pub(crate) fn activate_encryption(&mut self, secret: SharedSecret) {
        self.shared_secret = Some(secret);
        self.encryption.insert(EncryptionFlags::ACTIVE);
        self.ephemeral = None;
    }

    pub(crate) fn encryption_active(&self) -> bool {
        self.encryption.contains(EncryptionFlags::ACTIVE)
    }

    /// Whether this side will negotiate encryption if the peer offers it.
    pub(crate) fn wants_encryption(&self) -> bool {
        self.supports_encryption() && self.encryption.contains(EncryptionFlags::PEER_REQUESTS)
    }

    pub(crate) fn supports_encryption(&self) -> bool {
        self.encryption.contains(EncryptionFlags::LOCALLY_SUPPORTS)
            && !self.encryption.contains(EncryptionFlags::FORCE_DISABLED)
    }

    pub(crate) fn encryption_forced(&self) -> bool {
        self.encryption.contains(EncryptionFlags::FORCE_REQUIRED)
    }

    pub(crate) fn set_ready(&mut self, now: Instant) {
        info!(
            handle = self.index,
            role = ?self.role,
            peer = ?self.remote_endpoint,
            encrypted = self.encryption_active(),
            "session ready"
        );
        self.state = SessionState::Ready;
        self.phase = HandshakePhase::None;
        self.liveness.restart(now);
    }

    pub(crate) fn set_dead(&mut self, reason: &str) {
        info!(handle = self.index, reason, "session dead");
        self.state = SessionState::Dead;
        self.clear_crypto();
    }

    /// Send without applying the keystream. Used for handshake messages.
    pub(crate) fn send_plain(&mut self, packet: &Packet, now: Instant) -> bool {
        let payload = packet.encode();
        self.transmit(payload, now)
    }

    /// Send through the keystream when encryption is active.
    pub(crate) fn send_sealed(&mut self, packet: &Packet, now: Instant) -> bool {
        let payload = packet.encode();
        match &self.shared_secret {
            Some(secret) if self.encryption.contains(EncryptionFlags::ACTIVE) => {
                let mut buf = BytesMut::from(&payload[..]);
                keystream::apply(secret, self.seq_out, &mut buf);
                self.transmit(buf.freeze(), now)
            }
            _ => self.transmit(payload, now),
        }
    }

    fn transmit(&mut self, payload: Bytes, now: Instant) -> bool {
        let (Some(transport), Some(target)) = (self.transport.as_ref(), self.remote_endpoint)
        else {
            debug!(handle = self.index, "send on session without transport or peer");
            return false;
        };

        let seq = self.seq_out;
        let wire = Frame::new(seq, payload).encode();
        if wire.len() > self.max_datagram_bytes {
            warn!(
                handle = self.index,
                len = wire.len(),
                limit = self.max_datagram_bytes,
                "frame too large to send"
            );
            return false;
        }
        match transport.send_to(&wire, target) {
            Ok(_) => {
                self.seq_out = seq.wrapping_add(1);
                self.liveness.on_send(now);
                true
            }
            Err(e) => {
                warn!(handle = self.index, %target, "send failed: {}", e);
                false
            }
        }
    }

    /// One non-blocking receive attempt through integrity check, endpoint
    /// filter, sequence check and decryption.
    ///
    /// A `Ready` session accepts any sequence number at or above
    /// `seq_in_expected`, not only the exact next one, and resynchronizes
    /// to it. Lost datagrams therefore leave a gap instead of stalling the
    /// session; only replays and reordered stale frames are dropped.
    pub(crate) fn receive(&mut self, now: Instant) -> Inbound {
        let Some(transport) = self.transport.as_ref() else {
            return Inbound::Nothing;
        };
        if self.recv_buf.is_empty() {
            // One spare byte so an oversized datagram is seen as oversized
            // rather than silently truncated.
            self.recv_buf = vec![0u8; self.max_datagram_bytes + 1];
        }

        let (len, src) = match transport.try_recv_from(&mut self.recv_buf) {
            Ok(Some(received)) => received,
            Ok(None) => return Inbound::Nothing,
            Err(e) => {
                debug!(handle = self.index, "receive failed: {}", e);
                return Inbound::Nothing;
            }
        };

        if self.state == SessionState::Dead {
            return Inbound::Dropped;
        }
        if len >= self.recv_buf.len() {
            debug!(handle = self.index, %src, "dropping oversized datagram");
            return Inbound::Dropped;
        }

        let frame = match Frame::decode(Bytes::copy_from_slice(&self.recv_buf[..len])) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(handle = self.index, %src, "dropping frame: {}", e);
                return Inbound::Dropped;
            }
        };

        let from_peer = self.remote_endpoint == Some(src);
        let listening = self.role == Role::Server && self.state != SessionState::Ready;
        if !from_peer && !listening {
            debug!(handle = self.index, %src, "dropping frame from unknown endpoint");
            return Inbound::Dropped;
        }

        self.liveness.on_receive(now);

        if self.state == SessionState::Ready && frame.seq < self.seq_in_expected {
            debug!(
                handle = self.index,
                seq = frame.seq,
                expected = self.seq_in_expected,
                "dropping stale frame"
            );
            return Inbound::Dropped;
        }
        self.seq_in_expected = frame.seq.wrapping_add(1);

        let payload = match &self.shared_secret {
            Some(secret) if self.encryption.contains(EncryptionFlags::ACTIVE) => {
                let mut buf = BytesMut::from(&frame.payload[..]);
                keystream::apply(secret, frame.seq, &mut buf);
                buf.freeze()
            }
            _ => frame.payload,
        };

        match Packet::decode(payload) {
            Ok(packet) => Inbound::Packet(packet, src),
            Err(e) => {
                debug!(handle = self.index, %src, seq = frame.seq, "dropping payload: {}", e);
                Inbound::Dropped
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("index", &self.index)
            .field("open", &self.is_open())
            .field("state", &self.state)
            .field("role", &self.role)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("seq_out", &self.seq_out)
            .field("seq_in_expected", &self.seq_in_expected)
            .field("encryption", &self.encryption)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
