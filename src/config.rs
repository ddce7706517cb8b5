//! Service configuration
//!
//! Values come from (lowest to highest precedence): built-in defaults, an
//! optional TOML file, and `URLPOOL_*` environment variables.
//!
//! ```toml
//! data_dir = "/var/lib/urlpool"
//! cache_dir = "/var/cache/urlpool"
//! text_pool_size = 10000
//! ttl_secs = 86400
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`URLPOOL_TTL_SECS`, `URLPOOL_CACHE_DIR`, ...)
pub const ENV_PREFIX: &str = "URLPOOL";

/// Longest accepted TTL (10 years)
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding one journal per pool
    pub data_dir: PathBuf,
    /// Media disk cache directory (created on demand)
    pub cache_dir: PathBuf,
    /// Slots provisioned for the text/image pool
    pub text_pool_size: u32,
    /// Slots provisioned for the video pool
    pub video_pool_size: u32,
    /// Lifetime of a binding, renewed on every registration
    pub ttl_secs: u64,
    /// Upper bound on any single row or url lock wait
    pub lock_timeout_ms: u64,
    /// Upstream image request timeout
    pub fetch_timeout_ms: u64,
    /// Upstream body size cap
    pub max_fetch_bytes: u64,
    /// Largest `max_size` a registrant may request
    pub max_image_dimension: u32,
    /// Journal batches written before automatic compaction (0 disables)
    pub compact_after_batches: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/urlpool"),
            cache_dir: PathBuf::from("data/urlpool/cache"),
            text_pool_size: 10_000,
            video_pool_size: 10_000,
            ttl_secs: 24 * 60 * 60,
            lock_timeout_ms: 5_000,
            fetch_timeout_ms: 30_000,
            max_fetch_bytes: 50 * 1024 * 1024,
            max_image_dimension: 2048,
            compact_after_batches: 10_000,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no pool or cache can run with
    pub fn validate(&self) -> Result<()> {
        if self.text_pool_size == 0 || self.video_pool_size == 0 {
            return Err(Error::Config("pool sizes must be at least 1".to_string()));
        }
        if self.ttl_secs == 0 {
            return Err(Error::Config("ttl_secs must be positive".to_string()));
        }
        if self.ttl_secs > MAX_TTL_SECS {
            return Err(Error::Config(format!(
                "ttl_secs must be at most {} (10 years), got {}",
                MAX_TTL_SECS, self.ttl_secs
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be positive".to_string()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(Error::Config("fetch_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Result<chrono::Duration> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| Error::Config(format!("ttl_secs out of range: {}", self.ttl_secs)))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Journal file for a pool
    pub fn journal_path(&self, pool: crate::pool::PoolKind) -> PathBuf {
        self.data_dir.join(format!("{}.journal", pool.table_name()))
    }
}
