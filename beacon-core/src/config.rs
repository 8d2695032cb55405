//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tracking endpoint configuration
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Which collection endpoint events are delivered to
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Regular tracking endpoint
    #[default]
    Track,
    /// Bulk ingestion endpoint
    Ingest,
}

impl OperationMode {
    /// Endpoint path for track requests in this mode
    pub fn track_endpoint_path(&self) -> &'static str {
        match self {
            OperationMode::Track => "/v0/native/track",
            OperationMode::Ingest => "/v0/native/ingest",
        }
    }
}

/// Tracker configuration
///
/// When enabled, events passed to the tracker are sent to `base_url`.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Enable/disable event delivery
    #[serde(default)]
    pub enabled: bool,

    /// Collection endpoint base URL (e.g., `https://collect.example.com`)
    pub base_url: Option<String>,

    /// Application key sent with every request
    pub app_key: Option<String>,

    /// Endpoint selection
    #[serde(default)]
    pub operation_mode: OperationMode,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds between reachability probes
    #[serde(default = "default_reachability_interval")]
    pub reachability_interval_secs: u64,

    /// Max resubmissions of a request that failed transiently
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Build requests but never create a tracker
    #[serde(default)]
    pub dry_run: bool,

    /// Drop every event before it reaches the queue
    #[serde(default)]
    pub opt_out: bool,

    /// Host application version reported in `app_info`
    pub app_version: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            app_key: None,
            operation_mode: OperationMode::default(),
            timeout_secs: default_timeout(),
            reachability_interval_secs: default_reachability_interval(),
            max_retries: default_max_retries(),
            dry_run: false,
            opt_out: false,
            app_version: None,
        }
    }
}

impl TrackerConfig {
    /// Check if the tracker is enabled and has everything it needs
    pub fn is_ready(&self) -> bool {
        self.enabled && !self.dry_run && self.base_url.is_some() && self.app_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        match &self.base_url {
            None => {
                return Err(Error::Config(
                    "tracker.base_url is required when tracker is enabled".to_string(),
                ))
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(Error::Config(format!(
                    "tracker.base_url must be an http(s) URL, got {url:?}"
                )))
            }
            Some(_) => {}
        }
        if self.app_key.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(
                "tracker.app_key is required when tracker is enabled".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "tracker.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.reachability_interval_secs == 0 {
            return Err(Error::Config(
                "tracker.reachability_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interval between reachability probes
    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_interval_secs)
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_reachability_interval() -> u64 {
    10
}

fn default_max_retries() -> usize {
    3
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }
}
