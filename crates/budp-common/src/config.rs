//! Runtime configuration for session registries.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use budp_core::MAX_DATAGRAM_SIZE;

use crate::helpers::env_parse;
use crate::{Error, Result};

pub const DEFAULT_MAX_SESSIONS: usize = 150;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_INITIAL_SEQUENCE: u32 = 100;
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = MAX_DATAGRAM_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudpConfig {
    /// Number of session slots.
    pub max_sessions: usize,
    /// Silence after which a heartbeat-enabled session is declared dead.
    pub heartbeat_timeout_ms: u64,
    /// Keepalive transmit period.
    pub heartbeat_interval_ms: u64,
    /// First outbound sequence number.
    pub initial_sequence: u32,
    /// Largest frame sent or accepted, at most `MAX_DATAGRAM_SIZE`.
    pub max_datagram_bytes: usize,
    /// Root of the identity pinning store. `None` uses the per-user data
    /// directory.
    pub pin_dir: Option<PathBuf>,
}

impl Default for BudpConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            initial_sequence: DEFAULT_INITIAL_SEQUENCE,
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM_BYTES,
            pin_dir: None,
        }
    }
}

impl BudpConfig {
    /// Defaults overlaid with `BUDP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("BUDP_MAX_SESSIONS")? {
            cfg.max_sessions = v;
        }
        if let Some(v) = env_parse("BUDP_HEARTBEAT_TIMEOUT_MS")? {
            cfg.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_parse("BUDP_HEARTBEAT_INTERVAL_MS")? {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("BUDP_INITIAL_SEQUENCE")? {
            cfg.initial_sequence = v;
        }
        if let Some(dir) = std::env::var_os("BUDP_PIN_DIR") {
            if !dir.is_empty() {
                cfg.pin_dir = Some(PathBuf::from(dir));
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a JSON document. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::config("max_sessions must be at least 1"));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(Error::config("heartbeat_timeout_ms must be non-zero"));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.heartbeat_timeout_ms
        {
            return Err(Error::config(format!(
                "heartbeat_interval_ms ({}) must be between 1 and heartbeat_timeout_ms ({})",
                self.heartbeat_interval_ms, self.heartbeat_timeout_ms
            )));
        }
        if !(64..=MAX_DATAGRAM_SIZE).contains(&self.max_datagram_bytes) {
            return Err(Error::config(format!(
                "max_datagram_bytes ({}) must be between 64 and {MAX_DATAGRAM_SIZE}",
                self.max_datagram_bytes
            )));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
