//! Configuration management for Kiln CLI

use anyhow::{Context, Result};
use kiln_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine cache configuration
    pub cache: CacheConfig,

    /// Defaults for `kiln simulate`
    pub simulate: SimulateConfig,
}

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Artificial build time of the synthetic builder in milliseconds
    pub build_delay_ms: u64,

    /// Concurrent callers per simulated call
    pub threads: usize,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            build_delay_ms: 0,
            threads: 1,
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    ///
    /// `KILN_*` environment overrides are applied to the cache section.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path(),
        };

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            config
        };

        config.cache = config.cache.with_env_overrides();
        config
            .cache
            .validate()
            .with_context(|| format!("Invalid cache configuration in {}", config_path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".config"))
            .join("kiln")
            .join("config.toml")
    }

    /// Cache directory, preferring an explicit command-line value
    pub fn cache_dir(&self, explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cache.cache_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load(Some(path.as_path())).unwrap();
        assert!(path.exists());
        assert_eq!(config.simulate.threads, 1);
    }

    #[test]
    fn test_partial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\ncache_dir = \"/var/cache/kiln\"\n[simulate]\nthreads = 4\n").unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.simulate.threads, 4);
        assert_eq!(config.simulate.build_delay_ms, 0);
        assert_eq!(config.cache_dir(None), PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.cache_dir(Some(Path::new("/tmp/x"))), PathBuf::from("/tmp/x"));
    }
}
