//! Configuration for the seller ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Optimistic concurrency retry policy
    pub retry: RetryConfig,

    /// Withdrawal approval policy
    pub withdrawal: WithdrawalPolicy,

    /// Entries read per page by the ledger cursor
    pub ledger_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/seller-ledger"),
            service_name: "seller-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            retry: RetryConfig::default(),
            withdrawal: WithdrawalPolicy::default(),
            ledger_page_size: 256,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Retry policy for optimistic commits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before failing with `Contention`
    pub max_attempts: u32,

    /// First backoff (milliseconds)
    pub initial_backoff_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_backoff_ms: u64,

    /// Exponential growth per attempt
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), exponential with jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_micros(((capped + jitter).max(0.0) * 1000.0) as u64)
    }
}

/// Withdrawal approval policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalPolicy {
    /// Fast withdrawals up to this amount are created already approved
    pub fast_auto_approve_limit: Option<u64>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("SELLER_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(attempts) = std::env::var("SELLER_LEDGER_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.parse().map_err(|e| {
                crate::Error::Config(format!("SELLER_LEDGER_MAX_ATTEMPTS: {}", e))
            })?;
        }

        if let Ok(limit) = std::env::var("SELLER_LEDGER_FAST_AUTO_APPROVE_LIMIT") {
            let limit = limit.parse().map_err(|e| {
                crate::Error::Config(format!("SELLER_LEDGER_FAST_AUTO_APPROVE_LIMIT: {}", e))
            })?;
            config.withdrawal.fast_auto_approve_limit = Some(limit);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ledger_page_size == 0 {
            return Err(crate::Error::Config(
                "ledger_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
