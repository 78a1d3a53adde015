#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use budp_common::helpers::env_bool;
use budp_common::BudpConfig;
use budp_session::{Message, Registry, SessionHandle, SessionState};
use clap::Parser;
use tracing::{error, info, warn};

const SESSION: SessionHandle = SessionHandle::new(0);

#[derive(Parser, Debug)]
#[command(name = "budp-client")]
struct Args {
    /// Server host name or address
    #[arg(long, env = "BUDP_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server UDP port
    #[arg(long, env = "BUDP_PORT", default_value_t = 8080)]
    port: u16,

    /// Seed for this client's identity and pinning namespace
    #[arg(long, env = "BUDP_SEED", default_value = "CLIENT_SECRET_SEED")]
    seed: String,

    /// Ask for encryption when the server offers it
    #[arg(long, env = "BUDP_ENCRYPT", default_value_t = false)]
    encrypt: bool,

    /// Abort unless the session is encrypted
    #[arg(long, env = "BUDP_REQUIRE_ENCRYPTION", default_value_t = false)]
    require_encryption: bool,

    /// Disable the liveness timeout (also `BUDP_NO_HEARTBEAT=1`)
    #[arg(long, default_value_t = false)]
    no_heartbeat: bool,

    /// Seconds between application messages once connected
    #[arg(long, default_value_t = 5)]
    send_interval: u64,

    /// Seconds to wait for the handshake before sending CONN again
    #[arg(long, default_value_t = 3)]
    retry_interval: u64,

    /// Directory for pinned server identities
    #[arg(long, env = "BUDP_PIN_DIR")]
    pin_dir: Option<PathBuf>,

    /// JSON configuration file; `BUDP_*` variables are used otherwise
    #[arg(long, env = "BUDP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<BudpConfig> {
    let mut config = match &args.config {
        Some(path) => BudpConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BudpConfig::from_env().context("invalid BUDP_* environment")?,
    };
    if args.pin_dir.is_some() {
        config.pin_dir = args.pin_dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    budp_common::init_tracing_with_default(&args.log_level);

    let config = load_config(&args)?;
    let mut registry = Registry::with_config(&args.seed, config)?;

    if !registry.open(SESSION, 0) {
        bail!("could not open a UDP socket");
    }
    if !(args.no_heartbeat || env_bool("BUDP_NO_HEARTBEAT", false)) {
        registry.enable_heartbeat(SESSION);
    }
    if args.encrypt {
        registry.request_encryption(SESSION);
    }
    if args.require_encryption {
        registry.require_encryption(SESSION);
    }

    info!(host = %args.host, port = args.port, "connecting");
    if !registry.connect(SESSION, &args.host, args.port) {
        bail!("could not reach {}:{}", args.host, args.port);
    }

    let send_interval = Duration::from_secs(args.send_interval);
    let retry_interval = Duration::from_secs(args.retry_interval);
    let mut last_attempt = Instant::now();
    let mut last_send = Instant::now();

    loop {
        match registry.update(SESSION) {
            Some(Message::Connected) => {
                let secure = registry.encryption_active(SESSION);
                info!(encrypted = secure, "handshake complete");
                registry.send(SESSION, b"Hello Server!");
                last_send = Instant::now();
            }
            Some(Message::Application(data)) => {
                info!("server replied: {}", String::from_utf8_lossy(&data));
            }
            Some(Message::MitmDetected) => {
                error!("server identity does not match the pinned identity");
                bail!("possible man-in-the-middle on {}", args.host);
            }
            Some(Message::EncryptionRequiredButUnavailable) => {
                error!("server cannot provide the required encryption");
                bail!("connection blocked: encryption unavailable");
            }
            Some(Message::Dead) => {
                warn!("session ended");
                return Ok(());
            }
            None => {
                let now = Instant::now();
                match registry.state(SESSION) {
                    Some(SessionState::Ready)
                        if now.duration_since(last_send) >= send_interval =>
                    {
                        registry.send(SESSION, b"Still here!");
                        last_send = now;
                    }
                    Some(SessionState::Connecting)
                        if now.duration_since(last_attempt) >= retry_interval =>
                    {
                        info!("no answer yet; retrying");
                        registry.connect(SESSION, &args.host, args.port);
                        last_attempt = now;
                    }
                    _ => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        }
    }
}
