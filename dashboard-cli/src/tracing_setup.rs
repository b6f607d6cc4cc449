//! Tracing setup for the dashboard CLI
//!
//! Usage:
//!   dashboard --debug ...                  # Debug logging
//!   RUST_LOG=dashboard_db=trace dashboard  # Fine-grained log control
//!
//! Filter precedence: `RUST_LOG`, then `--debug`, then `LOG_LEVEL` from the settings.
//! Logs go to stderr, or are appended to `LOG_FILE` when it is set.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Force debug logging unless RUST_LOG is set
    pub debug: bool,
    /// Filter directive used when neither RUST_LOG nor --debug apply
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: "info".to_string(),
            file: None,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        let fallback = if self.debug { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }
}

pub fn init(config: &TracingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.debug) // Show targets in debug mode
        .compact();

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| anyhow!(err))
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow!(err)),
    }
}
