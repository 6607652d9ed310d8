//! Node cache configuration.
//!
//! Provides configuration file support via `nodecache.toml`, environment
//! variables, and programmatic overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (builder methods)
//! 2. Environment variables (`NODECACHE_<SECTION>__<KEY>`)
//! 3. Configuration file (`nodecache.toml`)
//! 4. Default values
//!
//! Values are checked once by [`NodeCacheConfig::validate`]; the eviction path
//! assumes a validated configuration.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::cache_mode::CacheMode;

/// Default resident memory budget (64 MiB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default number of LRU shards.
pub const DEFAULT_LRU_SHARDS: usize = 4;

/// Upper bound on LRU shards.
pub const MAX_LRU_SHARDS: usize = 1024;

/// Default dirty-to-full byte ratio below which a leaf container is compacted.
///
/// Both sides count slot keys plus resident record bytes.
pub const DEFAULT_DELTA_THRESHOLD: f64 = 0.25;

/// Default headroom a pass reclaims below the budget (64 KiB).
pub const DEFAULT_BATCH_BYTES: u64 = 64 * 1024;

/// Default overage at which the triggering thread evicts inline (1 MiB).
pub const DEFAULT_CRITICAL_OVERAGE_BYTES: u64 = 1024 * 1024;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Maximum resident memory in bytes.
    pub max_memory_bytes: u64,
    /// Number of independent LRU shards.
    pub lru_shards: usize,
    /// Environment-wide default cache mode.
    pub default_cache_mode: CacheMode,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            lru_shards: DEFAULT_LRU_SHARDS,
            default_cache_mode: CacheMode::Default,
        }
    }
}

/// Evictor section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictorSection {
    /// Dirty-to-full byte ratio below which a dirty leaf container is
    /// compacted to a delta. Strictly between 0 and 1.
    pub delta_threshold: f64,
    /// Bytes a pass reclaims below the budget before stopping.
    pub batch_bytes: u64,
    /// Overage above the budget at which the thread that pushed memory over
    /// runs an inline pass instead of only waking the daemon.
    pub critical_overage_bytes: u64,
    /// Spawn the background eviction daemon.
    pub background: bool,
    /// Flush dirty nodes once no clean candidate is left.
    pub flush_on_pressure: bool,
}

impl Default for EvictorSection {
    fn default() -> Self {
        Self {
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            batch_bytes: DEFAULT_BATCH_BYTES,
            critical_overage_bytes: DEFAULT_CRITICAL_OVERAGE_BYTES,
            background: true,
            flush_on_pressure: true,
        }
    }
}

/// Main node cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeCacheConfig {
    /// Cache configuration.
    pub cache: CacheSection,
    /// Evictor configuration.
    pub evictor: EvictorSection,
}

impl NodeCacheConfig {
    /// Loads configuration from default sources.
    ///
    /// Priority: defaults < file < environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("nodecache.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NODECACHE_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Creates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_memory_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cache.max_memory_bytes".to_string(),
                message: "value must be > 0".to_string(),
            });
        }

        if !(1..=MAX_LRU_SHARDS).contains(&self.cache.lru_shards) {
            return Err(ConfigError::InvalidValue {
                key: "cache.lru_shards".to_string(),
                message: format!(
                    "value {} is out of range [1, {MAX_LRU_SHARDS}]",
                    self.cache.lru_shards
                ),
            });
        }

        let threshold = self.evictor.delta_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "evictor.delta_threshold".to_string(),
                message: format!("value {threshold} must be strictly between 0 and 1"),
            });
        }

        if self.evictor.batch_bytes >= self.cache.max_memory_bytes {
            return Err(ConfigError::InvalidValue {
                key: "evictor.batch_bytes".to_string(),
                message: format!(
                    "value {} must be below cache.max_memory_bytes ({})",
                    self.evictor.batch_bytes, self.cache.max_memory_bytes
                ),
            });
        }

        Ok(())
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Sets the memory budget.
    #[must_use]
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.cache.max_memory_bytes = bytes;
        self
    }

    /// Sets the number of LRU shards.
    #[must_use]
    pub fn with_lru_shards(mut self, shards: usize) -> Self {
        self.cache.lru_shards = shards;
        self
    }

    /// Sets the environment default cache mode.
    #[must_use]
    pub fn with_default_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache.default_cache_mode = mode;
        self
    }

    /// Sets the delta compaction threshold.
    #[must_use]
    pub fn with_delta_threshold(mut self, threshold: f64) -> Self {
        self.evictor.delta_threshold = threshold;
        self
    }

    /// Sets the per-pass headroom.
    #[must_use]
    pub fn with_batch_bytes(mut self, bytes: u64) -> Self {
        self.evictor.batch_bytes = bytes;
        self
    }

    /// Sets the inline eviction overage.
    #[must_use]
    pub fn with_critical_overage(mut self, bytes: u64) -> Self {
        self.evictor.critical_overage_bytes = bytes;
        self
    }

    /// Enables or disables the background daemon.
    #[must_use]
    pub fn with_background_evictor(mut self, enabled: bool) -> Self {
        self.evictor.background = enabled;
        self
    }

    /// Enables or disables flushing dirty nodes under pressure.
    #[must_use]
    pub fn with_flush_on_pressure(mut self, enabled: bool) -> Self {
        self.evictor.flush_on_pressure = enabled;
        self
    }
}
