#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use budp_common::helpers::env_bool;
use budp_common::BudpConfig;
use budp_session::{Message, Registry, SessionHandle};
use clap::Parser;
use tracing::{info, warn};

const SESSION: SessionHandle = SessionHandle::new(0);

#[derive(Parser, Debug)]
#[command(name = "budp-server")]
struct Args {
    /// UDP port to listen on
    #[arg(long, env = "BUDP_PORT", default_value_t = 8080)]
    port: u16,

    /// Seed for this server's public identity
    #[arg(long, env = "BUDP_SEED", default_value = "SERVER_SECRET_SEED")]
    seed: String,

    /// Advertise no encryption support
    #[arg(long, env = "BUDP_NO_ENCRYPT", default_value_t = false)]
    no_encrypt: bool,

    /// Refuse clients that decline encryption
    #[arg(long, env = "BUDP_REQUIRE_ENCRYPTION", default_value_t = false)]
    require_encryption: bool,

    /// Disable the liveness timeout (also `BUDP_NO_HEARTBEAT=1`)
    #[arg(long, default_value_t = false)]
    no_heartbeat: bool,

    /// JSON configuration file; `BUDP_*` variables are used otherwise
    #[arg(long, env = "BUDP_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    print_config: bool,

    /// Delay between polls in milliseconds
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> Result<BudpConfig> {
    match path {
        Some(path) => BudpConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => BudpConfig::from_env().context("invalid BUDP_* environment"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    budp_common::init_tracing_with_default(&args.log_level);

    if args.no_encrypt && args.require_encryption {
        bail!("--no-encrypt and --require-encryption are mutually exclusive");
    }

    let config = load_config(args.config.as_ref())?;
    if args.print_config {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }
    let mut registry = Registry::with_config(&args.seed, config)?;

    if !registry.open(SESSION, args.port) {
        bail!("could not bind UDP port {}", args.port);
    }
    if !(args.no_heartbeat || env_bool("BUDP_NO_HEARTBEAT", false)) {
        registry.enable_heartbeat(SESSION);
    }
    if args.no_encrypt {
        registry.disable_encryption_support(SESSION);
    }
    if args.require_encryption {
        registry.require_encryption(SESSION);
    }

    info!(
        port = args.port,
        public_id = registry.public_identity(SESSION).unwrap_or_default(),
        "budp-server listening"
    );

    let poll = Duration::from_millis(args.poll_ms);
    loop {
        match registry.update(SESSION) {
            Some(Message::Connected) => {
                info!(
                    peer = ?registry.remote_endpoint(SESSION),
                    encrypted = registry.encryption_active(SESSION),
                    "client connected"
                );
            }
            Some(Message::Application(data)) => {
                info!("client sent: {}", String::from_utf8_lossy(&data));
                registry.send(SESSION, b"Message Received.");
            }
            Some(Message::Dead) => {
                warn!("connection lost; waiting for a new client");
                registry.reset(SESSION);
            }
            Some(other) => {
                warn!(event = ?other, "handshake aborted");
                registry.reset(SESSION);
            }
            None => std::thread::sleep(poll),
        }
    }
}
