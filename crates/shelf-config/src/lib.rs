//! # shelf-config
//!
//! Configuration management for Shelf.
//!
//! Loads configuration from:
//! 1. `~/.shelf/config.toml` (global)
//! 2. `.shelf/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::logging::LogLevel;

/// Project-local config file, relative to the working directory
pub const PROJECT_CONFIG: &str = ".shelf/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(Path::new(PROJECT_CONFIG)))?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load and layer the given files. Missing files are skipped; keys in
    /// `project` override the same keys in `global`.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }
        Ok(toml::Value::Table(merged).try_into::<Config>()?)
    }

    /// Global config path: ~/.shelf/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".shelf/config.toml"))
    }

    /// Apply environment variable overrides, reading variables through
    /// `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SHELF_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("SHELF_MAX_ENTRIES") {
            match raw.parse() {
                Ok(n) => self.cache.max_entries = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid SHELF_MAX_ENTRIES"),
            }
        }
    }

    /// Directory the cache's store lives in, with `~` expanded.
    pub fn cache_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir).join(&self.storage.subdir)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root data directory
    pub data_dir: PathBuf,
    /// Cache store directory, relative to `data_dir`
    pub subdir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.shelf"),
            subdir: "cache".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of objects the store holds
    pub max_entries: u32,
    /// Entries added with any of these label keys are released aggressively
    pub aggressive_release_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 8192,
            aggressive_release_keys: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
}

impl LoggingConfig {
    /// Parsed level, falling back to `Warn` for unknown names.
    pub fn log_level(&self) -> LogLevel {
        self.level.parse().unwrap_or(LogLevel::Warn)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                    continue;
                }
                base.insert(key, toml::Value::Table(incoming));
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}
