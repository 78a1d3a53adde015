//! Fixed-capacity table of sessions addressed by [`SessionHandle`].
//!
//! Operations on an out-of-range handle, or on a slot that was never
//! opened, have no effect. The exceptions are the encryption and heartbeat
//! settings: they may be set before `open` and are kept by it.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use budp_common::{BudpConfig, Error, Result};
use budp_core::{ControlMessage, Packet};
use budp_crypto::{namespace_for_seed, FsPinStore, LocalIdentity, PinStore};
use bytes::Bytes;

use crate::handshake::PinContext;
use crate::liveness::LivenessAction;
use crate::session::{
    EncryptionFlags, HandshakePhase, Inbound, Message, Role, Session, SessionState,
};
use crate::transport::{Transport, UdpTransport};

/// Registry guarded by one coarse lock, for drivers on several threads.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Index of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(usize);

impl SessionHandle {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for SessionHandle {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

pub struct Registry {
    slots: Vec<Session>,
    pins: Arc<dyn PinStore>,
    namespace: String,
}

impl Registry {
    /// Registry configured from `BUDP_*` environment variables, pinning to
    /// the filesystem.
    pub fn init(seed: &str) -> Result<Self> {
        Self::with_config(seed, BudpConfig::from_env()?)
    }

    pub fn with_config(seed: &str, config: BudpConfig) -> Result<Self> {
        let root = match config.pin_dir.clone() {
            Some(dir) => dir,
            None => FsPinStore::default_root().ok_or_else(|| {
                Error::config("no home directory for the pin store; set BUDP_PIN_DIR")
            })?,
        };
        debug!(root = %root.display(), "using filesystem pin store");
        Self::with_pin_store(seed, config, Arc::new(FsPinStore::new(root)))
    }

    pub fn with_pin_store(
        seed: &str,
        config: BudpConfig,
        pins: Arc<dyn PinStore>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = LocalIdentity::from_seed(seed);
        let slots = (0..config.max_sessions)
            .map(|index| Session::new(index, identity, &config))
            .collect();

        Ok(Self {
            slots,
            pins,
            namespace: namespace_for_seed(seed),
        })
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots.get(handle.0)
    }

    fn slot_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.0)
    }

    fn open_slot_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.0).filter(|s| s.is_open())
    }

    /// Bind a UDP socket on `port`. Port 0 opens a client on an ephemeral
    /// port; any other port opens a server. An already-open slot is
    /// replaced.
    pub fn open(&mut self, handle: SessionHandle, port: u16) -> bool {
        if self.slot(handle).is_none() {
            debug!(handle = handle.0, "open on out-of-range handle");
            return false;
        }
        let role = if port == 0 { Role::Client } else { Role::Server };
        match UdpTransport::bind(port) {
            Ok(transport) => self.attach(handle, Box::new(transport), role),
            Err(e) => {
                warn!(handle = handle.0, port, "bind failed: {}", e);
                false
            }
        }
    }

    /// Install an arbitrary transport.
    pub fn attach(
        &mut self,
        handle: SessionHandle,
        transport: Box<dyn Transport>,
        role: Role,
    ) -> bool {
        let Some(session) = self.slot_mut(handle) else {
            return false;
        };
        let local = transport.local_addr().ok();
        session.install(transport, role);
        info!(handle = handle.0, ?role, local = ?local, "session opened");
        true
    }

    /// Start a handshake with `host:port`. Returns whether `CONN` was sent.
    ///
    /// Any handshake already in progress on the slot is abandoned.
    pub fn connect(&mut self, handle: SessionHandle, host: &str, port: u16) -> bool {
        let Some(session) = self.open_slot_mut(handle) else {
            return false;
        };
        if session.role != Role::Client {
            debug!(handle = handle.0, "connect on a server session");
            return false;
        }
        if session.state == SessionState::Dead {
            debug!(handle = handle.0, "connect on a dead session; reset first");
            return false;
        }

        let target = match resolve_ipv4(host, port) {
            Some(addr) => addr,
            None => {
                warn!(handle = handle.0, host, port, "could not resolve peer");
                return false;
            }
        };

        session.clear_crypto();
        session.seq_in_expected = 0;
        session.remote_endpoint = Some(target);
        session.remote_host_label = Some(host.to_string());

        let hello = ControlMessage::Conn {
            identity: session.identity.public(),
        };
        if !session.send_plain(&hello.into(), Instant::now()) {
            session.state = SessionState::Idle;
            return false;
        }

        session.state = SessionState::Connecting;
        session.phase = HandshakePhase::AwaitingAuth;
        info!(handle = handle.0, %target, "connecting");
        true
    }

    pub fn update(&mut self, handle: SessionHandle) -> Option<Message> {
        self.update_at(handle, Instant::now())
    }

    /// Poll once at an explicit time: one receive attempt, then liveness.
    pub fn update_at(&mut self, handle: SessionHandle, now: Instant) -> Option<Message> {
        let pins = PinContext {
            store: self.pins.as_ref(),
            namespace: &self.namespace,
        };
        let session = self.slots.get_mut(handle.0).filter(|s| s.is_open())?;

        if let Inbound::Packet(packet, src) = session.receive(now) {
            if let Some(event) = session.on_packet(packet, src, &pins, now) {
                return Some(event);
            }
        }

        if session.state != SessionState::Ready {
            return None;
        }
        match session.liveness.poll(now) {
            LivenessAction::TimedOut => {
                warn!(
                    handle = handle.0,
                    peer = ?session.remote_endpoint,
                    "heartbeat timeout"
                );
                session.set_dead("heartbeat timeout");
                Some(Message::Dead)
            }
            LivenessAction::SendKeepalive => {
                session.send_sealed(&ControlMessage::Heartbeat.into(), now);
                None
            }
            LivenessAction::Idle => None,
        }
    }

    /// Send application bytes. Returns whether a frame was transmitted.
    pub fn send(&mut self, handle: SessionHandle, payload: &[u8]) -> bool {
        let Some(session) = self.open_slot_mut(handle) else {
            return false;
        };
        if session.state != SessionState::Ready {
            debug!(handle = handle.0, state = ?session.state, "send before ready");
            return false;
        }
        session.send_sealed(
            &Packet::Data(Bytes::copy_from_slice(payload)),
            Instant::now(),
        )
    }

    pub fn is_ready(&self, handle: SessionHandle) -> bool {
        self.slot(handle)
            .is_some_and(|s| s.is_open() && s.state == SessionState::Ready)
    }

    /// Return to `Idle`, keeping the transport and remote endpoint.
    pub fn reset(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            session.reset();
            debug!(handle = handle.0, "session reset");
        }
    }

    /// Release the transport and clear all session state.
    pub fn close(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            if session.is_open() {
                info!(handle = handle.0, "session closed");
            }
            session.shutdown();
        }
    }

    /// Replace the slot's identity. Pinned records are left untouched and
    /// stay in the namespace of the seed passed to `init`.
    pub fn rekey(&mut self, handle: SessionHandle, seed: &str) {
        if let Some(session) = self.slot_mut(handle) {
            session.identity = LocalIdentity::from_seed(seed);
            session.clear_crypto();
            session.state = SessionState::Idle;
            info!(handle = handle.0, identity = ?session.identity, "session rekeyed");
        }
    }

    pub fn enable_heartbeat(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            session.liveness.enable(Instant::now());
        }
    }

    /// Ask for encryption when the server offers it.
    pub fn request_encryption(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            session.encryption.insert(EncryptionFlags::PEER_REQUESTS);
        }
    }

    /// Refuse to complete a handshake without encryption.
    pub fn require_encryption(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            session.encryption.insert(
                EncryptionFlags::FORCE_REQUIRED
                    | EncryptionFlags::PEER_REQUESTS
                    | EncryptionFlags::LOCALLY_SUPPORTS,
            );
            session.encryption.remove(EncryptionFlags::FORCE_DISABLED);
        }
    }

    /// Never negotiate encryption; servers advertise `NoE`.
    pub fn disable_encryption_support(&mut self, handle: SessionHandle) {
        if let Some(session) = self.slot_mut(handle) {
            session.encryption.insert(EncryptionFlags::FORCE_DISABLED);
            session
                .encryption
                .remove(EncryptionFlags::LOCALLY_SUPPORTS | EncryptionFlags::FORCE_REQUIRED);
        }
    }

    pub fn public_identity(&self, handle: SessionHandle) -> Option<u64> {
        self.slot(handle).map(|s| s.identity.public())
    }

    pub fn state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.slot(handle).map(|s| s.state)
    }

    pub fn role(&self, handle: SessionHandle) -> Option<Role> {
        self.slot(handle).filter(|s| s.is_open()).map(|s| s.role)
    }

    pub fn local_addr(&self, handle: SessionHandle) -> Option<SocketAddr> {
        self.slot(handle)?.transport.as_ref()?.local_addr().ok()
    }

    pub fn remote_endpoint(&self, handle: SessionHandle) -> Option<SocketAddr> {
        self.slot(handle)?.remote_endpoint
    }

    pub fn encryption_active(&self, handle: SessionHandle) -> bool {
        self.slot(handle).is_some_and(|s| s.encryption_active())
    }
}

fn resolve_ipv4(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()?
        .find(SocketAddr::is_ipv4)
}
