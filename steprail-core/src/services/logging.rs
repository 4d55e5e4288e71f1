//! Logging service

use crate::models::LogLevel;
use anyhow::{anyhow, Result};

/// Initialize logging with the specified level
///
/// `RUST_LOG` is ignored; the filter is derived from `level` so the CLI flag
/// and the configuration file stay authoritative.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let filter = match level {
        LogLevel::Error => "steprail=error,steprail_core=error",
        LogLevel::Warn => "steprail=warn,steprail_core=warn",
        LogLevel::Info => "steprail=info,steprail_core=info",
        LogLevel::Debug => "steprail=debug,steprail_core=debug",
        LogLevel::Trace => "steprail=trace,steprail_core=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Log a failure that was contained instead of propagated
pub fn log_error(error: &str, context: Option<&str>) {
    tracing::error!(
        error = error,
        context = context.unwrap_or(""),
        "System error occurred"
    );
}
