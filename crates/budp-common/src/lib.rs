//! Shared utilities for BUDP: configuration, logging, error types.
//!
//! This crate provides common infrastructure used by the session library
//! and the demo binaries.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod helpers;

pub use config::BudpConfig;
pub use error::{Error, Result};

/// Initialize tracing. `RUST_LOG` wins over `default_level` when set.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
