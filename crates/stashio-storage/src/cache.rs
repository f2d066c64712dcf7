//! Memory cache for envelopes
//!
//! A bounded, non-authoritative copy of recently used envelopes. When the
//! entry count exceeds the limit, entries with the oldest `lastAccessed`
//! timestamp are evicted first; a logical clock breaks ties between entries
//! touched within the same millisecond.

use parking_lot::Mutex;
use stashio_common::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted by pruning
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct CacheEntry {
    envelope: Envelope,
    /// Logical clock value of the last touch
    tick: u64,
}

/// Bounded envelope cache keyed by primary key
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Maximum number of entries kept after pruning
    limit: usize,
    /// Logical clock for LRU tie-breaking
    clock: AtomicU64,
    stats: CacheStats,
}

impl MemoryCache {
    /// Create a new cache holding at most `limit` entries
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(limit.min(4096))),
            limit,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up an envelope, stamping `lastAccessed = now_ms` on a hit
    pub fn get(&self, key: &str, now_ms: u64) -> Option<Envelope> {
        let tick = self.tick();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.envelope.last_accessed = now_ms;
            entry.tick = tick;
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.envelope.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert or refresh an envelope, then prune if over the limit
    ///
    /// Returns the number of entries evicted.
    pub fn insert(&self, key: impl Into<String>, envelope: Envelope) -> usize {
        let tick = self.tick();
        let mut entries = self.entries.lock();
        entries.insert(key.into(), CacheEntry { envelope, tick });
        self.prune_locked(&mut entries)
    }

    /// Remove an envelope
    pub fn remove(&self, key: &str) -> Option<Envelope> {
        self.entries.lock().remove(key).map(|e| e.envelope)
    }

    /// Check if key is in cache (does not count as an access)
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Evict the least recently accessed entries down to the limit
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        self.prune_locked(&mut entries)
    }

    fn prune_locked(&self, entries: &mut HashMap<String, CacheEntry>) -> usize {
        if entries.len() <= self.limit {
            return 0;
        }

        let mut by_age: Vec<(u64, u64, String)> = entries
            .iter()
            .map(|(k, e)| (e.envelope.last_accessed, e.tick, k.clone()))
            .collect();
        by_age.sort_unstable();

        let excess = entries.len() - self.limit;
        for (_, _, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }

        self.stats
            .evictions
            .fetch_add(excess as u64, Ordering::Relaxed);
        excess
    }

    /// Clear the entire cache
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get current cache size
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
