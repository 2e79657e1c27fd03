//! Configuration loading and config file resolution
//!
//! Bootstrap configuration lives in a single TOML file. Every field has a
//! compiled default, so a partial file (or no file at all) still yields a
//! complete [`FloodgateConfig`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "FLOODGATE_CONFIG";

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5780";

/// Top-level configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FloodgateConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Admission-control windows
    pub limits: LimitsConfig,

    /// Event stream tuning
    pub streams: StreamConfig,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            logging: LoggingConfig::default(),
            limits: LimitsConfig::default(),
            streams: StreamConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Capacity and duration of one sliding window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    /// Maximum number of requests tracked within `window_ms`
    pub capacity: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl WindowConfig {
    pub const fn new(capacity: usize, window_ms: u64) -> Self {
        Self { capacity, window_ms }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config(format!("limits.{name}.capacity must be > 0")));
        }
        if self.window_ms == 0 {
            return Err(Error::Config(format!("limits.{name}.window_ms must be > 0")));
        }
        Ok(())
    }
}

/// Socket-level and IP-level admission windows
///
/// Socket windows see every request of their traffic class; the IP-level
/// shared windows only see the bursts their socket windows delegate upward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub socket_read: WindowConfig,
    pub socket_write: WindowConfig,
    pub ip_read: WindowConfig,
    pub ip_write: WindowConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            socket_read: WindowConfig::new(10, 1_000),
            socket_write: WindowConfig::new(4, 1_000),
            ip_read: WindowConfig::new(40, 2_000),
            ip_write: WindowConfig::new(12, 2_000),
        }
    }
}

/// Event stream tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Bound of each stream's inbound (producer → dispatcher) channel
    pub inbound_capacity: usize,
    /// Bound of each subscription's channel
    pub subscriber_capacity: usize,
    /// Longest the dispatcher waits on one full subscriber channel
    pub subscriber_send_timeout_ms: u64,
    /// Emit one `data:` line per payload line
    pub split_data_lines: bool,
    /// Deadline for graceful stream shutdown
    pub graceful_stop_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 256,
            subscriber_capacity: 64,
            subscriber_send_timeout_ms: 5_000,
            split_data_lines: true,
            graceful_stop_timeout_ms: 5_000,
        }
    }
}

impl StreamConfig {
    pub fn subscriber_send_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_send_timeout_ms)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_timeout_ms)
    }
}

impl FloodgateConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load the resolved config file, falling back to defaults when none exists
    ///
    /// A missing file is not fatal; a file that exists but does not parse is.
    pub fn load_or_default(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("No config file location available, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject configurations the admission engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.limits.socket_read.validate("socket_read")?;
        self.limits.socket_write.validate("socket_write")?;
        self.limits.ip_read.validate("ip_read")?;
        self.limits.ip_write.validate("ip_write")?;

        if self.streams.inbound_capacity == 0 || self.streams.subscriber_capacity == 0 {
            return Err(Error::Config(
                "streams channel capacities must be > 0".to_string(),
            ));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(Error::Config("bind_addr must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Config file resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. Platform config directory (`<config_dir>/floodgate/config.toml`)
///
/// Returns `None` when no candidate location can be determined, in which
/// case compiled defaults apply.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("floodgate").join("config.toml"))
}
