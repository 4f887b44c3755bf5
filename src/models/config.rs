//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Quality gates for acceptance and in-place upgrade
    #[serde(default)]
    pub quality: QualityConfig,

    /// Extraction retry budget and job parallelism
    #[serde(default)]
    pub retry: RetryConfig,

    /// Server-side sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Client cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.quality.acceptance_threshold > 100 {
            return Err(AppError::validation(
                "quality.acceptance_threshold must be <= 100",
            ));
        }
        if self.quality.upgrade_threshold > 100 {
            return Err(AppError::validation(
                "quality.upgrade_threshold must be <= 100",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(AppError::validation(
                "retry.attempt_timeout_secs must be > 0",
            ));
        }
        if self.retry.total_budget_secs < self.retry.attempt_timeout_secs {
            return Err(AppError::validation(
                "retry.total_budget_secs must be >= retry.attempt_timeout_secs",
            ));
        }
        if self.retry.max_concurrent_jobs == 0 {
            return Err(AppError::validation(
                "retry.max_concurrent_jobs must be > 0",
            ));
        }
        if self.sync.page_size == 0 {
            return Err(AppError::validation("sync.page_size must be > 0"));
        }
        if self.sync.push_batch_size == 0 {
            return Err(AppError::validation("sync.push_batch_size must be > 0"));
        }
        Ok(())
    }
}

/// Score thresholds consumed by the retry loop and the dedup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Minimum score for the retry loop to accept an attempt
    #[serde(default = "defaults::acceptance_threshold")]
    pub acceptance_threshold: u8,

    /// Minimum stored score for a dedup hit to be reused as-is
    #[serde(default = "defaults::upgrade_threshold")]
    pub upgrade_threshold: u8,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: defaults::acceptance_threshold(),
            upgrade_threshold: defaults::upgrade_threshold(),
        }
    }
}

/// Retry budget for a single extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum extraction attempts per job
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Wall-clock limit for one extractor call, in seconds
    #[serde(default = "defaults::attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Wall-clock limit for the whole job, in seconds
    #[serde(default = "defaults::total_budget")]
    pub total_budget_secs: u64,

    /// Independent jobs allowed to run at once
    #[serde(default = "defaults::max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            attempt_timeout_secs: defaults::attempt_timeout(),
            total_budget_secs: defaults::total_budget(),
            max_concurrent_jobs: defaults::max_concurrent_jobs(),
        }
    }
}

/// Server-side sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum items returned by one incremental pull
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,

    /// Maximum items a client sends in one push
    #[serde(default = "defaults::push_batch_size")]
    pub push_batch_size: usize,

    /// Days a tombstone is kept before garbage collection
    #[serde(default = "defaults::tombstone_retention_days")]
    pub tombstone_retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: defaults::page_size(),
            push_batch_size: defaults::push_batch_size(),
            tombstone_retention_days: defaults::tombstone_retention_days(),
        }
    }
}

/// Client cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age after which a cached row is considered stale, in seconds
    #[serde(default = "defaults::ttl")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::ttl(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    // Quality defaults
    pub fn acceptance_threshold() -> u8 {
        60
    }
    pub fn upgrade_threshold() -> u8 {
        80
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn attempt_timeout() -> u64 {
        60
    }
    pub fn total_budget() -> u64 {
        180
    }
    pub fn max_concurrent_jobs() -> usize {
        4
    }

    // Sync defaults
    pub fn page_size() -> usize {
        500
    }
    pub fn push_batch_size() -> usize {
        100
    }
    pub fn tombstone_retention_days() -> u32 {
        30
    }

    // Cache defaults
    pub fn ttl() -> u64 {
        300
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn defaults_pin_thresholds() {
        let config = Config::default();
        assert_eq!(config.quality.acceptance_threshold, 60);
        assert_eq!(config.quality.upgrade_threshold, 80);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_budget_below_attempt_timeout() {
        let mut config = Config::default();
        config.retry.attempt_timeout_secs = 120;
        config.retry.total_budget_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_attempts = 5

            [sync]
            page_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.attempt_timeout_secs, 60);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.quality.upgrade_threshold, 80);
    }

    #[test]
    fn load_or_default_on_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(tmp.path().join("missing.toml"));
        assert_eq!(config.sync.push_batch_size, 100);
    }
}
