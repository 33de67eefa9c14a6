//! SchemaPrysm Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.schemaprysm/config.toml`
//! - Local config: `.schemaprysm/config.toml` (in workspace)
//! - Overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → overrides.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Log levels accepted by `[logging] level`.
const KNOWN_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration for SchemaPrysm.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchemaPrysmConfig {
    /// Snapshot cache configuration
    pub cache: CacheConfig,

    /// Lazy collection loading
    pub lazy_loading: LazyLoadingConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Snapshot cache configuration.
///
/// # Example TOML
///
/// ```toml
/// [cache]
/// enabled = true
/// max_cache_size = 100
/// default_expiration_secs = 1800
/// memory_limit_mb = 512
/// compaction_interval_secs = 300
/// hit_rate_threshold = 0.7
/// enable_statistics = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the snapshot cache
    pub enabled: bool,

    /// Maximum number of cached snapshots
    pub max_cache_size: usize,

    /// Default time-to-live for an entry, in seconds
    pub default_expiration_secs: u64,

    /// Memory budget for all cached snapshots, in MB
    pub memory_limit_mb: u64,

    /// Interval between background sweeps of expired entries, in seconds
    pub compaction_interval_secs: u64,

    /// Hit rate (0.0 - 1.0) below which a warning is raised
    pub hit_rate_threshold: f64,

    /// Track hit/miss counters
    pub enable_statistics: bool,

    /// Number of requests before the hit rate threshold is evaluated
    pub min_requests_for_hit_rate: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: 100,
            default_expiration_secs: 30 * 60,
            memory_limit_mb: 512,
            compaction_interval_secs: 5 * 60,
            hit_rate_threshold: 0.7,
            enable_statistics: true,
            min_requests_for_hit_rate: 100,
        }
    }
}

impl CacheConfig {
    /// Default entry time-to-live.
    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }

    /// Interval between compaction sweeps.
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    /// Memory budget in bytes.
    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    /// Validate cache settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::invalid_value(
                "cache.max_cache_size",
                "must be greater than 0",
            ));
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::invalid_value(
                "cache.memory_limit_mb",
                "must be greater than 0",
            ));
        }
        if self.compaction_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "cache.compaction_interval_secs",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.hit_rate_threshold) {
            return Err(ConfigError::invalid_value(
                "cache.hit_rate_threshold",
                format!("{} is outside 0.0..=1.0", self.hit_rate_threshold),
            ));
        }
        Ok(())
    }
}

/// Lazy loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LazyLoadingConfig {
    /// Hydrate model collections on first access instead of up front
    pub enabled: bool,
}

/// Storage configuration for persisted models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for SchemaPrysm data (default: `.schemaprysm`)
    pub data_dir: PathBuf,

    /// SQLite database file name inside `data_dir`
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".schemaprysm"),
            database_file: "models.db".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Validate the configured level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.level.to_lowercase();
        if KNOWN_LOG_LEVELS.contains(&level.as_str()) {
            Ok(())
        } else {
            Err(ConfigError::invalid_value(
                "logging.level",
                format!(
                    "unknown level '{}'. Valid values: {}",
                    self.level,
                    KNOWN_LOG_LEVELS.join(", ")
                ),
            ))
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}'. Valid values: text, json", s),
            )),
        }
    }
}

/// Overrides for configuration values.
///
/// Applied over file-based config by the embedding application.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override data directory
    pub data_dir: Option<PathBuf>,

    /// Enable or disable the snapshot cache
    pub cache_enabled: Option<bool>,

    /// Override the maximum number of cached snapshots
    pub max_cache_size: Option<usize>,

    /// Enable or disable lazy loading
    pub lazy_loading: Option<bool>,

    /// Override log level
    pub log_level: Option<String>,

    /// Override log format
    pub log_format: Option<LogFormat>,
}

impl SchemaPrysmConfig {
    /// Apply overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref dir) = overrides.data_dir {
            self.storage.data_dir = dir.clone();
        }

        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = enabled;
        }

        if let Some(size) = overrides.max_cache_size {
            self.cache.max_cache_size = size;
        }

        if let Some(enabled) = overrides.lazy_loading {
            self.lazy_loading.enabled = enabled;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.logging.validate()?;
        if self.storage.database_file.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "storage.database_file",
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Get the effective data directory for a workspace.
    pub fn data_dir(&self, workspace_root: &std::path::Path) -> PathBuf {
        if self.storage.data_dir.is_absolute() {
            self.storage.data_dir.clone()
        } else {
            workspace_root.join(&self.storage.data_dir)
        }
    }

    /// Get the SQLite database path for a workspace.
    pub fn database_path(&self, workspace_root: &std::path::Path) -> PathBuf {
        self.data_dir(workspace_root)
            .join(&self.storage.database_file)
    }
}
