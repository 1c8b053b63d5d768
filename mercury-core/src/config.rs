//! Configuration management for mercury
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/mercury/
//! - macOS: ~/Library/Application Support/mercury/
//! - Windows: %APPDATA%\mercury\

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::supervisor::SupervisorConfig;

/// Environment variable that overrides `connection.access_token`
pub const ACCESS_TOKEN_ENV: &str = "MERCURY_ACCESS_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL of the event endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// Bearer token. Prefer the environment variable over storing it here.
    pub access_token: Option<String>,

    /// Request low-latency framing for voice/video
    #[serde(default = "default_true")]
    pub voice_video: bool,
}

/// Timers and retry bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Which frames are dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_call_prefixes")]
    pub call_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_url() -> String {
    "wss://localhost:8443/events".to_string()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    60
}
fn default_batch_interval() -> u64 {
    500
}
fn default_backoff_min() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    32_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_call_prefixes() -> Vec<String> {
    vec![crate::batcher::DEFAULT_CALL_PREFIX.to_string()]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            access_token: None,
            voice_video: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            batch_interval_ms: default_batch_interval(),
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            call_prefixes: default_call_prefixes(),
        }
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("mercury"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Token from the environment, falling back to the config file
    pub fn access_token(&self) -> Option<String> {
        self.resolve_access_token(std::env::var(ACCESS_TOKEN_ENV).ok())
    }

    fn resolve_access_token(&self, from_env: Option<String>) -> Option<String> {
        from_env
            .filter(|t| !t.is_empty())
            .or_else(|| self.connection.access_token.clone())
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        let timing = &config.timing;
        Self {
            connect_timeout: Duration::from_secs(timing.connect_timeout_secs.max(1)),
            batch_interval: Duration::from_millis(timing.batch_interval_ms.max(1)),
            backoff: BackoffConfig {
                minimum: Duration::from_millis(timing.backoff_min_ms),
                maximum: Duration::from_millis(timing.backoff_max_ms),
                multiplier: timing.backoff_multiplier,
            },
            call_prefixes: config.events.call_prefixes.clone(),
            voice_video: config.connection.voice_video,
        }
    }
}
