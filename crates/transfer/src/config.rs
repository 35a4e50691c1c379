//! Engine configuration.
//!
//! Stored as TOML; every field is optional and falls back to its default:
//!
//! ```toml
//! default_bucket = "backups"
//! max_concurrent_transfers = 4
//! part_size = 8388608
//! store_path = "/var/lib/stowage/transfers.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_PART_SIZE;
use crate::retry::RetryPolicy;
use crate::validation::ValidationError;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Transfer engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bucket used when the caller does not override it.
    #[serde(default)]
    pub default_bucket: Option<String>,

    /// Transfers running at the same time.
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Parts in flight per transfer.
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,

    /// Payloads larger than this are split into parts.
    #[serde(default = "default_part_size")]
    pub multipart_threshold: u64,

    /// Size of every part but the last.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Attempt ceiling per part, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Network timeout of a single part attempt.
    #[serde(default = "default_part_timeout_ms")]
    pub part_timeout_ms: u64,

    /// Staging directory for streamed uploads (OS temp dir when unset).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Compare MD5 integrity tokens returned for uploaded bodies.
    #[serde(default = "default_true")]
    pub verify_integrity: bool,

    /// JSON record store; records live in memory only when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_part_concurrency() -> usize {
    4
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_part_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_bucket: None,
            max_concurrent_transfers: default_max_concurrent_transfers(),
            part_concurrency: default_part_concurrency(),
            multipart_threshold: default_part_size(),
            part_size: default_part_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            part_timeout_ms: default_part_timeout_ms(),
            temp_dir: None,
            verify_integrity: default_true(),
            store_path: None,
        }
    }
}

impl TransferConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: &str| Err(ValidationError::InvalidConfig(msg.into()));
        if self.max_concurrent_transfers == 0 {
            return invalid("max_concurrent_transfers must be at least 1");
        }
        if self.part_concurrency == 0 {
            return invalid("part_concurrency must be at least 1");
        }
        if self.part_size == 0 {
            return invalid("part_size must be at least 1 byte");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("backoff_factor must be a finite number >= 1.0");
        }
        if self.part_timeout_ms == 0 {
            return invalid("part_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            backoff_factor: self.backoff_factor,
        }
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_millis(self.part_timeout_ms)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
