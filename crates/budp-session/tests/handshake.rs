use budp_common::BudpConfig;
use budp_core::{Capability, ControlMessage, Frame, Packet};
use budp_crypto::{FsPinStore, MemoryPinStore, PinStore};
use budp_session::{Message, Registry, Role, SessionHandle, SessionState, UdpTransport};
use bytes::Bytes;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const H: SessionHandle = SessionHandle::new(0);
const CLIENT_SEED: &str = "CLIENT_SECRET_SEED";

fn temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("budp-session-{prefix}-{nanos}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config() -> BudpConfig {
    BudpConfig {
        max_sessions: 2,
        ..BudpConfig::default()
    }
}

fn server(seed: &str) -> (Registry, u16) {
    let mut reg =
        Registry::with_pin_store(seed, config(), Arc::new(MemoryPinStore::new())).unwrap();
    assert!(reg.attach(H, Box::new(UdpTransport::bind(0).unwrap()), Role::Server));
    let port = reg.local_addr(H).unwrap().port();
    (reg, port)
}

fn client(pins: Arc<dyn PinStore>) -> Registry {
    let mut reg = Registry::with_pin_store(CLIENT_SEED, config(), pins).unwrap();
    assert!(reg.open(H, 0));
    assert_eq!(reg.role(H), Some(Role::Client));
    reg
}

/// Poll both sides until each has produced an event or the deadline passes.
fn drive(client: &mut Registry, server: &mut Registry) -> (Option<Message>, Option<Message>) {
    let mut from_client = None;
    let mut from_server = None;
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline && (from_client.is_none() || from_server.is_none()) {
        if from_client.is_none() {
            from_client = client.update(H);
        }
        if from_server.is_none() {
            from_server = server.update(H);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    (from_client, from_server)
}

/// Poll both sides until the client produces an event.
fn drive_client(client: &mut Registry, server: &mut Registry) -> Option<Message> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(msg) = client.update(H) {
            return Some(msg);
        }
        assert!(!client.is_ready(H));
        server.update(H);
        std::thread::sleep(Duration::from_millis(1));
    }
    None
}

fn poll_until(reg: &mut Registry, deadline: Duration) -> Option<Message> {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if let Some(msg) = reg.update(H) {
            return Some(msg);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn encrypted_handshake_and_echo_over_udp() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    let mut cli = client(Arc::new(MemoryPinStore::new()));
    cli.request_encryption(H);
    assert!(cli.connect(H, "127.0.0.1", port));

    let (c, s) = drive(&mut cli, &mut srv);
    assert_eq!(c, Some(Message::Connected));
    assert_eq!(s, Some(Message::Connected));
    assert!(cli.is_ready(H) && srv.is_ready(H));
    assert!(cli.encryption_active(H) && srv.encryption_active(H));
    assert_eq!(
        srv.remote_endpoint(H).map(|a| a.port()),
        cli.local_addr(H).map(|a| a.port())
    );

    assert!(cli.send(H, "héllo ::: wörld".as_bytes()));
    assert_eq!(
        poll_until(&mut srv, Duration::from_secs(5)),
        Some(Message::Application(Bytes::from("héllo ::: wörld")))
    );

    assert!(srv.send(H, b"Message Received."));
    assert_eq!(
        poll_until(&mut cli, Duration::from_secs(5)),
        Some(Message::Application(Bytes::from_static(b"Message Received.")))
    );
}

#[test]
fn plaintext_handshake_over_udp() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    let mut cli = client(Arc::new(MemoryPinStore::new()));
    assert!(cli.connect(H, "localhost", port));

    let (c, s) = drive(&mut cli, &mut srv);
    assert_eq!(c, Some(Message::Connected));
    assert_eq!(s, Some(Message::Connected));
    assert!(!cli.encryption_active(H));
}

#[test]
fn forced_encryption_never_reaches_ready() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    srv.disable_encryption_support(H);
    let mut cli = client(Arc::new(MemoryPinStore::new()));
    cli.require_encryption(H);
    assert!(cli.connect(H, "127.0.0.1", port));

    assert_eq!(
        drive_client(&mut cli, &mut srv),
        Some(Message::EncryptionRequiredButUnavailable)
    );
    assert_eq!(cli.state(H), Some(SessionState::Dead));
    assert!(!srv.is_ready(H));
}

#[test]
fn encryption_required_before_open_survives_open() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    srv.disable_encryption_support(H);

    let mut cli =
        Registry::with_pin_store(CLIENT_SEED, config(), Arc::new(MemoryPinStore::new())).unwrap();
    cli.require_encryption(H);
    cli.enable_heartbeat(H);
    assert!(cli.open(H, 0));
    assert!(cli.connect(H, "127.0.0.1", port));

    assert_eq!(
        drive_client(&mut cli, &mut srv),
        Some(Message::EncryptionRequiredButUnavailable)
    );
    assert_eq!(cli.state(H), Some(SessionState::Dead));
    assert!(!cli.encryption_active(H));
}

#[test]
fn pinning_detects_substituted_server() {
    let pins: Arc<dyn PinStore> = Arc::new(FsPinStore::new(temp_dir("mitm")));

    // First contact pins the genuine server.
    let (mut genuine, genuine_port) = server("SERVER_SECRET_SEED");
    let mut cli = client(pins.clone());
    cli.connect(H, "127.0.0.1", genuine_port);
    let (c, _) = drive(&mut cli, &mut genuine);
    assert_eq!(c, Some(Message::Connected));

    // A different identity on the same host is refused.
    let (mut imposter, imposter_port) = server("IMPOSTER_SEED");
    let mut cli = client(pins.clone());
    cli.connect(H, "127.0.0.1", imposter_port);
    assert_eq!(
        drive_client(&mut cli, &mut imposter),
        Some(Message::MitmDetected)
    );
    assert_eq!(cli.state(H), Some(SessionState::Dead));
    assert!(!cli.is_ready(H));

    // The genuine identity is still accepted.
    cli.reset(H);
    genuine.reset(H);
    cli.connect(H, "127.0.0.1", genuine_port);
    let (c, s) = drive(&mut cli, &mut genuine);
    assert_eq!(c, Some(Message::Connected));
    assert_eq!(s, Some(Message::Connected));
}

#[test]
fn corrupted_frames_are_dropped_without_state_change() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let target = ("127.0.0.1", port);

    let hello = Frame::new(
        100,
        Packet::from(ControlMessage::Conn { identity: 4242 }).encode(),
    )
    .encode();
    let payload_start = hello.len() - "CONN::4242".len();

    let mut buf = [0u8; 1024];
    for idx in payload_start..hello.len() {
        for bit in 0..8 {
            let mut corrupt = hello.to_vec();
            corrupt[idx] ^= 1 << bit;
            peer.send_to(&corrupt, target).unwrap();
            for _ in 0..3 {
                assert_eq!(srv.update(H), None);
            }
        }
    }
    assert_eq!(srv.state(H), Some(SessionState::Idle));
    assert_eq!(srv.remote_endpoint(H), None);
    assert!(peer.recv_from(&mut buf).is_err(), "server answered a corrupt frame");

    // The intact frame is answered with AUTH.
    peer.send_to(&hello, target).unwrap();
    poll_until(&mut srv, Duration::from_millis(200));
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (len, _) = peer.recv_from(&mut buf).unwrap();
    let reply = Frame::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
    assert!(matches!(
        Packet::decode(reply.payload).unwrap(),
        Packet::Control(ControlMessage::Auth {
            capability: Capability::Encryption,
            ..
        })
    ));
}

#[test]
fn heartbeat_keeps_session_alive_then_times_out() {
    let (mut srv, port) = server("SERVER_SECRET_SEED");
    srv.enable_heartbeat(H);
    let mut cli = client(Arc::new(MemoryPinStore::new()));
    cli.enable_heartbeat(H);
    cli.connect(H, "127.0.0.1", port);
    let (c, s) = drive(&mut cli, &mut srv);
    assert_eq!((c, s), (Some(Message::Connected), Some(Message::Connected)));

    let start = Instant::now();

    // Client emits a keepalive; the server's timer restarts on receipt.
    assert_eq!(cli.update_at(H, start + Duration::from_secs(4)), None);
    std::thread::sleep(Duration::from_millis(50));
    let received_at = Instant::now();
    assert_eq!(srv.update_at(H, received_at), None);
    assert_eq!(srv.update_at(H, received_at + Duration::from_secs(9)), None);
    assert!(srv.is_ready(H));

    // Silence past the threshold kills the session on the next update.
    assert_eq!(
        srv.update_at(H, received_at + Duration::from_secs(11)),
        Some(Message::Dead)
    );
    assert_eq!(srv.state(H), Some(SessionState::Dead));

    // Only reset brings it back.
    srv.reset(H);
    assert_eq!(srv.state(H), Some(SessionState::Idle));
}

#[test]
fn close_releases_the_socket() {
    let mut cli = client(Arc::new(MemoryPinStore::new()));
    assert!(cli.local_addr(H).is_some());
    cli.close(H);
    assert!(cli.local_addr(H).is_none());
    assert!(!cli.send(H, b"x"));
    assert_eq!(cli.update(H), None);
}
