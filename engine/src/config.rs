//! Configuration management for the perfwatch engine
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and environment variables, falling back to defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::thresholds::ThresholdSet;

/// Main configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retention store configuration
    pub storage: StorageConfig,

    /// Initial alert thresholds
    pub thresholds: ThresholdSet,

    /// Background monitor configuration
    pub monitor: MonitorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Retention store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Maximum number of metric rows kept after an eviction pass
    pub max_history_records: usize,

    /// Maximum number of error rows kept after an eviction pass.
    /// Errors are not capped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_error_records: Option<usize>,

    /// Retry policy for failed writes
    pub write_retry: RetryConfig,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Backoff multiplier applied to each subsequent retry
    pub backoff_multiplier: f64,

    /// How long one attempt waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

/// Background monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the background sampler loop
    pub enabled: bool,

    /// Seconds between cycles while running
    pub interval_secs: u64,

    /// Seconds to wait after a failed cycle
    pub backoff_secs: u64,

    /// Blocking window used to measure instantaneous CPU usage
    pub cpu_sample_interval_ms: u64,

    /// Also raise DISK_SPACE_LOW when disk usage exceeds the disk
    /// threshold. Off unless enabled.
    pub check_disk: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let default_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("perfwatch")
            .join("perfwatch.db");

        Self {
            database_path: default_path,
            max_history_records: 10_000,
            max_error_records: None,
            write_retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            backoff_multiplier: 2.0,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            backoff_secs: 60,
            cpu_sample_interval_ms: 100,
            check_disk: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before the given retry (1-based)
    pub fn delay_for(&self, retry: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        std::time::Duration::from_secs_f64(self.base_delay_ms as f64 * factor / 1000.0)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = EngineConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = EngineConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = EngineConfig::from_file(path)?;
            }
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables that are set
    fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }

        if let Some(max) = parse_env::<usize>("MAX_HISTORY_RECORDS")? {
            self.storage.max_history_records = max;
        }

        if let Some(max) = parse_env::<usize>("MAX_ERROR_RECORDS")? {
            self.storage.max_error_records = Some(max);
        }

        if let Some(interval) = parse_env::<u64>("PERFWATCH_MONITOR_INTERVAL")? {
            self.monitor.interval_secs = interval;
        }

        if let Ok(level) = std::env::var("PERFWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.storage.max_history_records == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_history_records".to_string(),
                value: "0".to_string(),
            });
        }

        if self.storage.max_error_records == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_error_records".to_string(),
                value: "0".to_string(),
            });
        }

        if self.storage.write_retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.write_retry.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }

        let multiplier = self.storage.write_retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.write_retry.backoff_multiplier".to_string(),
                value: self.storage.write_retry.backoff_multiplier.to_string(),
            });
        }

        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.interval_secs".to_string(),
                value: "0".to_string(),
            });
        }

        if self.monitor.backoff_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.backoff_secs".to_string(),
                value: "0".to_string(),
            });
        }

        for (name, value) in self.thresholds.entries() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("thresholds.{}", name),
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("perfwatch").join("perfwatch.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|_| ConfigError::PermissionDenied { path: path.to_string_lossy().to_string() })?;

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> ConfigResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { field: name.to_string(), value: raw }),
        Err(_) => Ok(None),
    }
}
