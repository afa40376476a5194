//! Configuration for the engine cache

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{CoreError, Result};

/// Environment variable enabling or disabling the on-disk cache
pub const ENV_CACHE_ENABLE: &str = "KILN_ENGINE_CACHE_ENABLE";
/// Environment variable overriding the cache directory
pub const ENV_CACHE_PATH: &str = "KILN_ENGINE_CACHE_PATH";
/// Environment variable enabling persistence after every build
pub const ENV_EAGER_PERSIST: &str = "KILN_EAGER_PERSIST";

/// Main configuration for the engine cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether engines and profiles are read from and written to `cache_dir`
    pub enabled: bool,

    /// Directory holding `.engine` and `.profile` files
    pub cache_dir: PathBuf,

    /// Persist right after every build instead of only at the flush point
    pub eager_persist: bool,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: PathBuf::from("./engine_cache"),
            eager_persist: false,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::from(e).with_path(path))?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            CoreError::configuration(
                "CONFIG_PARSE_FAILED",
                format!("Failed to parse cache configuration: {}", e),
                "Reading TOML configuration",
                "Check the file against the documented keys",
            )
            .with_path(path)
        })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            CoreError::configuration(
                "CONFIG_SERIALIZE_FAILED",
                format!("Failed to serialize cache configuration: {}", e),
                "Writing TOML configuration",
                "Report this as a bug",
            )
        })?;
        std::fs::write(path, content).map_err(|e| CoreError::from(e).with_path(path))?;
        Ok(())
    }

    /// Apply `KILN_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(ENV_CACHE_ENABLE) {
            self.enabled = parse_flag(&value);
        }
        if let Some(path) = std::env::var_os(ENV_CACHE_PATH) {
            self.cache_dir = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var(ENV_EAGER_PERSIST) {
            self.eager_persist = parse_flag(&value);
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.cache_dir.as_os_str().is_empty() {
            let mut err = CoreError::configuration(
                "CONFIG_EMPTY_CACHE_DIR",
                "cache_dir must not be empty when the cache is enabled",
                "Validating cache configuration",
                "Set cache_dir or disable the cache",
            );
            if let CoreError::Configuration { field_name, .. } = &mut err {
                *field_name = Some("cache_dir".to_string());
            }
            return Err(err);
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "0" | "false" | "off" | "no")
}
