//! Configuration loader with inheritance support.
//!
//! Loads configuration from multiple sources and merges them:
//! 1. Global config: `~/.schemaprysm/config.toml`
//! 2. Local config: `.schemaprysm/config.toml` (in workspace)
//! 3. Overrides
//!
//! Later sources override earlier ones.

use crate::error::ConfigError;
use crate::{
    CacheConfig, ConfigOverrides, LazyLoadingConfig, LoggingConfig, SchemaPrysmConfig,
    StorageConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Global configuration directory name.
const GLOBAL_CONFIG_DIR: &str = ".schemaprysm";

/// Local configuration directory name.
const LOCAL_CONFIG_DIR: &str = ".schemaprysm";

/// Configuration loader with caching and inheritance support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (e.g., `~/.schemaprysm`)
    global_config_dir: Option<PathBuf>,

    /// Cached global config
    global_config: Option<SchemaPrysmConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    ///
    /// Automatically detects the global config directory (`~/.schemaprysm`).
    pub fn new() -> Self {
        let global_config_dir = dirs::home_dir().map(|h| h.join(GLOBAL_CONFIG_DIR));

        Self {
            global_config_dir,
            global_config: None,
        }
    }

    /// Create a loader with a custom global config directory.
    ///
    /// Useful for testing.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
            global_config: None,
        }
    }

    /// Get the global config file path.
    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    /// Get the local config file path for a workspace.
    pub fn local_config_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(LOCAL_CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a workspace with optional overrides.
    ///
    /// Merges config in order: global → local → overrides, then validates
    /// the result.
    pub fn load(
        &mut self,
        workspace_root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<SchemaPrysmConfig, ConfigError> {
        let mut config = SchemaPrysmConfig::default();

        if let Some(global_config) = self.load_global()? {
            config = merge_configs(config, global_config);
        }

        if let Some(local_config) = self.load_local(workspace_root)? {
            config = merge_configs(config, local_config);
        }

        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load only the global configuration.
    pub fn load_global(&mut self) -> Result<Option<SchemaPrysmConfig>, ConfigError> {
        if let Some(ref config) = self.global_config {
            return Ok(Some(config.clone()));
        }

        let Some(global_path) = self.global_config_path() else {
            debug!("No home directory found, skipping global config");
            return Ok(None);
        };

        if !global_path.exists() {
            trace!("Global config not found at {:?}", global_path);
            return Ok(None);
        }

        debug!("Loading global config from {:?}", global_path);
        let config = load_config_file(&global_path)?;

        self.global_config = Some(config.clone());

        Ok(Some(config))
    }

    /// Load only the local configuration for a workspace.
    pub fn load_local(
        &self,
        workspace_root: &Path,
    ) -> Result<Option<SchemaPrysmConfig>, ConfigError> {
        let local_path = self.local_config_path(workspace_root);

        if !local_path.exists() {
            trace!("Local config not found at {:?}", local_path);
            return Ok(None);
        }

        debug!("Loading local config from {:?}", local_path);
        load_config_file(&local_path).map(Some)
    }

    /// Save configuration to the global config file.
    pub fn save_global(&self, config: &SchemaPrysmConfig) -> Result<(), ConfigError> {
        let Some(ref global_dir) = self.global_config_dir else {
            return Err(ConfigError::NoHomeDir);
        };

        save_config_file(&global_dir.join(CONFIG_FILE_NAME), config)
    }

    /// Save configuration to the local config file for a workspace.
    pub fn save_local(
        &self,
        workspace_root: &Path,
        config: &SchemaPrysmConfig,
    ) -> Result<(), ConfigError> {
        save_config_file(&self.local_config_path(workspace_root), config)
    }

    /// Initialize global configuration directory.
    ///
    /// Creates `~/.schemaprysm/config.toml` with default configuration.
    pub fn init_global(&self) -> Result<PathBuf, ConfigError> {
        let Some(ref global_dir) = self.global_config_dir else {
            return Err(ConfigError::NoHomeDir);
        };

        init_config_dir(global_dir)
    }

    /// Initialize local configuration for a workspace.
    ///
    /// Creates `.schemaprysm/config.toml` with default configuration.
    pub fn init_local(&self, workspace_root: &Path) -> Result<PathBuf, ConfigError> {
        init_config_dir(&workspace_root.join(LOCAL_CONFIG_DIR))
    }

    /// Clear cached global configuration.
    ///
    /// Forces reload on next `load_global()` call.
    pub fn clear_cache(&mut self) {
        self.global_config = None;
    }
}

/// Create a config directory with a default config file unless one exists.
fn init_config_dir(dir: &Path) -> Result<PathBuf, ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::create_dir(dir, e))?;
    }

    let config_path = dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        save_config_file(&config_path, &SchemaPrysmConfig::default())?;
    }

    Ok(config_path)
}

/// Load a configuration file from disk.
fn load_config_file(path: &Path) -> Result<SchemaPrysmConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

    toml::from_str(&content).map_err(|e| ConfigError::parse_toml(path, e))
}

/// Save a configuration file to disk.
fn save_config_file(path: &Path, config: &SchemaPrysmConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
}

/// Merge two configurations, with `overlay` taking precedence.
///
/// A field in `overlay` wins only when it differs from the default, so a
/// partial local file does not reset values set globally.
fn merge_configs(base: SchemaPrysmConfig, overlay: SchemaPrysmConfig) -> SchemaPrysmConfig {
    SchemaPrysmConfig {
        cache: merge_cache(base.cache, overlay.cache),
        lazy_loading: merge_lazy_loading(base.lazy_loading, overlay.lazy_loading),
        storage: merge_storage(base.storage, overlay.storage),
        logging: merge_logging(base.logging, overlay.logging),
    }
}

/// Pick `overlay` when it was explicitly changed from `default`.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge cache config.
fn merge_cache(base: CacheConfig, overlay: CacheConfig) -> CacheConfig {
    let d = CacheConfig::default();
    CacheConfig {
        enabled: pick(base.enabled, overlay.enabled, d.enabled),
        max_cache_size: pick(base.max_cache_size, overlay.max_cache_size, d.max_cache_size),
        default_expiration_secs: pick(
            base.default_expiration_secs,
            overlay.default_expiration_secs,
            d.default_expiration_secs,
        ),
        memory_limit_mb: pick(base.memory_limit_mb, overlay.memory_limit_mb, d.memory_limit_mb),
        compaction_interval_secs: pick(
            base.compaction_interval_secs,
            overlay.compaction_interval_secs,
            d.compaction_interval_secs,
        ),
        hit_rate_threshold: pick(
            base.hit_rate_threshold,
            overlay.hit_rate_threshold,
            d.hit_rate_threshold,
        ),
        enable_statistics: pick(
            base.enable_statistics,
            overlay.enable_statistics,
            d.enable_statistics,
        ),
        min_requests_for_hit_rate: pick(
            base.min_requests_for_hit_rate,
            overlay.min_requests_for_hit_rate,
            d.min_requests_for_hit_rate,
        ),
    }
}

/// Merge lazy loading config.
fn merge_lazy_loading(base: LazyLoadingConfig, overlay: LazyLoadingConfig) -> LazyLoadingConfig {
    LazyLoadingConfig {
        enabled: overlay.enabled || base.enabled,
    }
}

/// Merge storage config.
fn merge_storage(base: StorageConfig, overlay: StorageConfig) -> StorageConfig {
    let d = StorageConfig::default();
    StorageConfig {
        data_dir: pick(base.data_dir, overlay.data_dir, d.data_dir),
        database_file: pick(base.database_file, overlay.database_file, d.database_file),
    }
}

/// Merge logging config.
fn merge_logging(base: LoggingConfig, overlay: LoggingConfig) -> LoggingConfig {
    let d = LoggingConfig::default();
    LoggingConfig {
        level: pick(base.level, overlay.level, d.level),
        format: pick(base.format, overlay.format, d.format),
        file: overlay.file.or(base.file),
    }
}
