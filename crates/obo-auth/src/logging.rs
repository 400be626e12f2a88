//! Tracing subscriber setup for binaries embedding the auth core
//!
//! Library code only emits `tracing` events. Hosts that do not install their
//! own subscriber can call [`init_tracing`] once at startup. Logs go to
//! stderr; `RUST_LOG` overrides the configured level.
//!
//! ```rust,no_run
//! use obo_auth::logging::{LoggingConfig, init_tracing};
//!
//! init_tracing(&LoggingConfig::default())?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;

use serde::Deserialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `obo_auth=debug,audit::auth=info`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
        }
    }
}

impl LoggingConfig {
    /// JSON output at `info`, suitable for log shippers
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            structured: true,
        }
    }

    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            structured: false,
        }
    }

    fn filter(&self) -> io::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid log filter '{}': {e}", self.level),
                )
            }),
        }
    }
}

/// Install a global stderr subscriber
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> io::Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.filter()?);

    if config.structured {
        subscriber
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .map_err(|e| io::Error::other(e.to_string()))
    } else {
        subscriber
            .with(fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|e| io::Error::other(e.to_string()))
    }
}
