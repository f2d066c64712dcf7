//! Configuration for the storage manager
//!
//! All fields have defaults so a partial TOML/JSON document deserializes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries for `get_item_with_retry`
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default memory cache capacity (entries)
pub const DEFAULT_MEMORY_CACHE_LIMIT: usize = 100;
/// Default cleanup interval (10 minutes)
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(600_000);

/// Storage manager configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum retries for reads through the retry wrapper
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Emit per-operation diagnostic events
    #[serde(default)]
    pub debug: bool,
    /// Maximum number of envelopes kept in the memory cache
    #[serde(default = "default_memory_cache_limit")]
    pub memory_cache_limit: usize,
    /// Interval between background cleanup sweeps
    #[serde(
        default = "default_cleanup_interval",
        rename = "cleanup_interval_ms",
        with = "duration_ms"
    )]
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            debug: false,
            memory_cache_limit: DEFAULT_MEMORY_CACHE_LIMIT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// Set the retry budget
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable diagnostic logging
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the memory cache capacity
    #[must_use]
    pub const fn with_memory_cache_limit(mut self, limit: usize) -> Self {
        self.memory_cache_limit = limit;
        self
    }

    /// Set the cleanup interval
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_memory_cache_limit() -> usize {
    DEFAULT_MEMORY_CACHE_LIMIT
}

const fn default_cleanup_interval() -> Duration {
    DEFAULT_CLEANUP_INTERVAL
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
