//! Configuration data structures

use crate::models::workflow::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::workflow::pipeline::PipelineOptions;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(anyhow!("Unknown log level '{}'", other)),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Executor invocations allowed per step when recovery asks for a retry
    pub default_max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub retry_initial_delay_ms: u64,
    /// Backoff multiplier; values above 1.0 enable exponential backoff
    pub retry_backoff_multiplier: f64,
    /// Per-step timeout in seconds (unset = no timeout)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_seconds: Option<u64>,
    /// Where pipeline snapshots are stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_store_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_initial_delay_ms: 0,
            retry_backoff_multiplier: 1.0,
            step_timeout_seconds: None,
            snapshot_store_path: None,
        }
    }
}

impl Configuration {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Configuration::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration {}", path.display()))
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration {}", path.display()))
    }

    /// Get the XDG config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("steprail").join("config.toml"))
    }

    /// Default location of the JSON snapshot store
    pub fn default_snapshot_store_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".steprail").join("snapshots.json")
    }

    /// Configured snapshot store path or the default one
    pub fn snapshot_store_path(&self) -> PathBuf {
        self.snapshot_store_path
            .clone()
            .unwrap_or_else(Self::default_snapshot_store_path)
    }

    /// Map the file settings onto pipeline options
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            retry_policy: RetryPolicy {
                max_attempts: self.default_max_attempts,
                initial_delay_ms: self.retry_initial_delay_ms,
                exponential_backoff: self.retry_backoff_multiplier > 1.0,
                backoff_multiplier: self.retry_backoff_multiplier.max(1.0),
            },
            step_timeout: self.step_timeout_seconds.map(Duration::from_secs),
        }
    }
}
