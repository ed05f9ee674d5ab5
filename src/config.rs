//! Typed configuration for the query engine.
//!
//! Every recognized option is listed here with its default. The struct is
//! resolved once at startup and passed down as plain data.

use crate::error::{Result, TrackerError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that can force-disable the async strategy.
pub const ASYNC_BREW_ENV: &str = "VERSIONTRACKER_ASYNC_BREW";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub rate_limit: RateLimitConfig,
    pub async_brew: AsyncBrewConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Seconds between external calls
    pub base_interval: f64,
    pub min_interval: f64,
    pub max_interval: f64,
    pub adaptive: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_interval: 1.0,
            min_interval: 0.1,
            max_interval: 5.0,
            adaptive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsyncBrewConfig {
    pub enabled: bool,
    pub api_base_url: String,
    pub max_concurrency: usize,
}

impl Default for AsyncBrewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: "https://formulae.brew.sh/api".to_string(),
            max_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Defaults to `$XDG_CACHE_HOME/versiontracker`
    pub directory: Option<PathBuf>,
    pub ttl_secs: u64,
    pub max_memory_items: usize,
    pub max_disk_bytes: u64,
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            ttl_secs: 24 * 60 * 60,
            max_memory_items: 1000,
            max_disk_bytes: 100 * 1024 * 1024,
            compression_threshold: 1024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_cache_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    pub max_errors: usize,
    pub timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_workers: 10,
            max_errors: 3,
            timeout_secs: 30,
        }
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    /// Minimum score (0-100) for a name to count as a match
    pub similarity_threshold: u8,
    pub brew_path: PathBuf,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 75,
            brew_path: PathBuf::from("brew"),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| TrackerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.min_interval > rl.max_interval {
            return Err(TrackerError::Config(format!(
                "rate_limit.min_interval ({}) exceeds max_interval ({})",
                rl.min_interval, rl.max_interval
            )));
        }
        if self.batch.batch_size == 0 {
            return Err(TrackerError::Config("batch.batch_size must be positive".into()));
        }
        if self.batch.max_workers == 0 {
            return Err(TrackerError::Config("batch.max_workers must be positive".into()));
        }
        if self.batch.max_errors == 0 {
            return Err(TrackerError::Config("batch.max_errors must be positive".into()));
        }
        if self.async_brew.max_concurrency == 0 {
            return Err(TrackerError::Config(
                "async_brew.max_concurrency must be positive".into(),
            ));
        }
        if self.matching.similarity_threshold > 100 {
            return Err(TrackerError::Config(
                "matching.similarity_threshold must be within 0-100".into(),
            ));
        }
        Ok(())
    }
}

/// Get the cache directory (~/.cache/versiontracker/ or equivalent)
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("versiontracker")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/versiontracker")
    } else {
        PathBuf::from(".cache/versiontracker")
    }
}
