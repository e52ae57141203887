//! Connection configuration.
//!
//! Supports loading configuration from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Per-connection configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy repository settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Event subscription settings
    #[serde(default)]
    pub events: EventConfig,

    /// Job polling settings
    #[serde(default)]
    pub jobs: JobConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy repository aging.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Strong entries idle this long are demoted to weak (default: 900)
    #[serde(default = "default_proxy_idle_timeout_secs")]
    pub proxy_idle_timeout_secs: u64,

    /// Background sweep period (default: 600)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Run the background sweeper thread (default: false)
    #[serde(default)]
    pub sweep_enabled: bool,
}

/// Instance event monitoring.
#[derive(Debug, Deserialize, Clone)]
pub struct EventConfig {
    /// Grace window for events that arrive before a handler registers (default: 5000)
    #[serde(default = "default_missed_event_window_ms")]
    pub missed_event_window_ms: u64,

    /// WQL `WITHIN` polling interval (default: 2)
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
}

/// Remote job polling.
#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    /// Delay between job status polls (default: 100)
    #[serde(default = "default_job_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum time to wait for a job (default: 300)
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level filter (default: "wmi_proxy=info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_proxy_idle_timeout_secs() -> u64 {
    900
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_missed_event_window_ms() -> u64 {
    5000
}

fn default_polling_interval_secs() -> u64 {
    2
}

fn default_job_poll_interval_ms() -> u64 {
    100
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "wmi_proxy=info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            proxy_idle_timeout_secs: default_proxy_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_enabled: false,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            missed_event_window_ms: default_missed_event_window_ms(),
            polling_interval_secs: default_polling_interval_secs(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_job_poll_interval_ms(),
            timeout_secs: default_job_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CacheConfig {
    pub fn proxy_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl EventConfig {
    pub fn missed_event_window(&self) -> Duration {
        Duration::from_millis(self.missed_event_window_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse(_, msg) => ConfigError::Parse(path.display().to_string(), msg),
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse("<inline>".to_string(), e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    Read(String, String),

    #[error("Failed to parse config file '{0}': {1}")]
    Parse(String, String),
}
