//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::IdentityKind;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Blob store backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Seen-set sizing
    #[serde(default)]
    pub filter: FilterConfig,

    /// Checkpoint cadence and retention
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Retry policy for blob store calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Cold-start rebuild settings
    #[serde(default)]
    pub scanner: ScannerConfig,

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
        match self.storage.backend {
            Backend::Local if self.storage.root.trim().is_empty() => {
                return Err(AppError::validation("storage.root is empty"));
            }
            Backend::S3 | Backend::Gcs if self.storage.bucket.trim().is_empty() => {
                return Err(AppError::validation("storage.bucket is empty"));
            }
            _ => {}
        }
        if self.filter.capacity == 0 {
            return Err(AppError::validation("filter.capacity must be > 0"));
        }
        let p = self.filter.false_positive_rate;
        if !(p > 0.0 && p < 1.0) {
            return Err(AppError::validation(
                "filter.false_positive_rate must be in (0, 1)",
            ));
        }
        if self.checkpoint.every_items == 0 {
            return Err(AppError::validation("checkpoint.every_items must be > 0"));
        }
        if self.checkpoint.interval_secs == 0 {
            return Err(AppError::validation("checkpoint.interval_secs must be > 0"));
        }
        if self.checkpoint.retain_generations < 2 {
            return Err(AppError::validation(
                "checkpoint.retain_generations must be >= 2",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(AppError::validation(
                "retry.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.scanner.concurrency == 0 {
            return Err(AppError::validation("scanner.concurrency must be > 0"));
        }
        if self.scanner.identity_field.trim().is_empty() {
            return Err(AppError::validation("scanner.identity_field is empty"));
        }
        Ok(())
    }
}

/// Which object store holds job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Directory on the local filesystem
    #[default]
    Local,
    /// Process memory, lost on exit
    Memory,
    S3,
    Gcs,
}

impl std::str::FromStr for Backend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            other => Err(AppError::config(format!("unknown storage backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Root directory for the local backend
    #[serde(default = "defaults::root")]
    pub root: String,

    #[serde(default)]
    pub bucket: String,

    /// Key prefix prepended to every path inside the bucket
    #[serde(default)]
    pub prefix: String,

    /// Endpoint override for S3-compatible or GCS emulators
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the GCS bearer token
    #[serde(default = "defaults::token_env")]
    pub token_env: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            root: defaults::root(),
            bucket: String::new(),
            prefix: String::new(),
            endpoint: None,
            token_env: defaults::token_env(),
        }
    }
}

/// What happens when insertions outrun the configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPolicy {
    /// Open a new, larger generation with a tighter error rate
    #[default]
    Scale,
    /// Keep inserting into the single filter and report the overflow
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Expected distinct items for the first generation
    #[serde(default = "defaults::capacity")]
    pub capacity: u64,

    #[serde(default = "defaults::false_positive_rate")]
    pub false_positive_rate: f64,

    #[serde(default)]
    pub growth: GrowthPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::capacity(),
            false_positive_rate: defaults::false_positive_rate(),
            growth: GrowthPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoint after this many processed items
    #[serde(default = "defaults::every_items")]
    pub every_items: u64,

    /// Checkpoint at least this often while items are flowing
    #[serde(default = "defaults::interval_secs")]
    pub interval_secs: u64,

    /// Filter snapshots kept in the store
    #[serde(default = "defaults::retain_generations")]
    pub retain_generations: usize,

    /// Budget for the final checkpoint on shutdown
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Background checkpoints between key-derivation self-checks; 0 disables
    #[serde(default = "defaults::verify_every")]
    pub verify_every: u64,
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_items: defaults::every_items(),
            interval_secs: defaults::interval_secs(),
            retain_generations: defaults::retain_generations(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            verify_every: defaults::verify_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first one
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "defaults::max_jitter_ms")]
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
            max_jitter_ms: defaults::max_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Output blobs fetched in parallel during a rebuild
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Field of each output record that holds the item identity
    #[serde(default = "defaults::identity_field")]
    pub identity_field: String,

    #[serde(default)]
    pub identity_kind: IdentityKind,

    /// Records checked by the key-derivation self-check
    #[serde(default = "defaults::verify_sample")]
    pub verify_sample: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::concurrency(),
            identity_field: defaults::identity_field(),
            identity_kind: IdentityKind::default(),
            verify_sample: defaults::verify_sample(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::level(),
        }
    }
}

mod defaults {
    // Storage defaults
    pub fn root() -> String {
        "storage".into()
    }
    pub fn token_env() -> String {
        "GCS_BEARER_TOKEN".into()
    }

    // Filter defaults
    pub fn capacity() -> u64 {
        1_000_000
    }
    pub fn false_positive_rate() -> f64 {
        0.001
    }

    // Checkpoint defaults
    pub fn every_items() -> u64 {
        1000
    }
    pub fn interval_secs() -> u64 {
        60
    }
    pub fn retain_generations() -> usize {
        2
    }
    pub fn shutdown_timeout_secs() -> u64 {
        30
    }
    pub fn verify_every() -> u64 {
        10
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn base_delay_ms() -> u64 {
        200
    }
    pub fn max_delay_ms() -> u64 {
        10_000
    }
    pub fn backoff_multiplier() -> f64 {
        2.0
    }
    pub fn max_jitter_ms() -> u64 {
        250
    }

    // Scanner defaults
    pub fn concurrency() -> usize {
        8
    }
    pub fn identity_field() -> String {
        "url".into()
    }
    pub fn verify_sample() -> usize {
        64
    }

    pub fn level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filter.capacity, 1_000_000);
        assert_eq!(config.checkpoint.retain_generations, 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "s3"
            bucket = "crawl-output"
            prefix = "jobs"

            [filter]
            capacity = 10000
            false_positive_rate = 0.01
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, Backend::S3);
        assert_eq!(config.filter.capacity, 10_000);
        assert_eq!(config.filter.growth, GrowthPolicy::Scale);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.scanner.identity_kind, IdentityKind::Url);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.filter.false_positive_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.checkpoint.retain_generations = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.backend = Backend::Gcs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("S3".parse::<Backend>().unwrap(), Backend::S3);
        assert!("ftp".parse::<Backend>().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/crawl-dedup.toml");
        assert_eq!(config.storage.backend, Backend::Local);
    }
}
