//! Storage Manager
//!
//! Wraps a [`StorageBackend`] with envelopes, expiry, a memory cache,
//! metadata indices and per-key serialization.
//!
//! # Write Path
//! 1. Lock the key
//! 2. Resolve the existing live envelope (keeps `created`)
//! 3. Persist the new envelope
//! 4. Refresh the memory cache (unless `skip_cache`)
//! 5. Move the key between index records to match the new metadata
//!
//! # Read Path
//! 1. Lock the key
//! 2. Check cache (live hit → return)
//! 3. Load from backend; expired → remove everywhere and return `None`
//! 4. Persist the refreshed `lastAccessed` and populate the cache
//!
//! Absent and expired keys read as `Ok(None)`; backend failures propagate.

use crate::backend::StorageBackend;
use crate::cache::{CacheStats, MemoryCache};
use crate::cleanup::CleanupTask;
use crate::index::IndexStore;
use crate::lock::KeyLocks;
use futures::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stashio_common::{
    BulkEntry, Clock, Envelope, Error, INDEX_PREFIX, ItemWithMetadata, Metadata, QueryHit, Result,
    SetOptions, StoreConfig, SystemClock, index_key, is_index_key,
};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Per-operation diagnostics, emitted only with `StoreConfig::debug`
macro_rules! diag {
    ($self:expr, $($arg:tt)+) => {
        if $self.config.debug {
            tracing::debug!($($arg)+);
        }
    };
}

/// Outcome of an expiration sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-index keys examined
    pub scanned: usize,
    /// Expired envelopes removed
    pub removed: usize,
    /// Memory cache entries evicted by the pruning step
    pub pruned: usize,
    pub duration: Duration,
}

/// Clears the in-flight sweep flag however the sweep ends
struct SweepFlag<'a>(&'a AtomicBool);

impl Drop for SweepFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Key/value storage manager over a pluggable backend
pub struct StorageManager {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    cache: MemoryCache,
    index: IndexStore,
    locks: Arc<KeyLocks>,
    /// Set while a sweep is running
    cleaning: AtomicBool,
}

impl StorageManager {
    /// Create a manager using the system clock
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit time source
    pub fn with_clock(
        backend: Arc<dyn StorageBackend>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(KeyLocks::new());
        let index = IndexStore::new(Arc::clone(&backend), Arc::clone(&locks));
        let cache = MemoryCache::new(config.memory_cache_limit);

        if config.debug {
            tracing::debug!(
                "storage manager over {} backend (cache limit {})",
                backend.name(),
                config.memory_cache_limit
            );
        }

        Self {
            backend,
            config,
            clock,
            cache,
            index,
            locks,
            cleaning: AtomicBool::new(false),
        }
    }

    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Start the periodic cleanup task at `cleanup_interval`
    ///
    /// The first sweep runs after a one second delay. The task stops when the
    /// returned handle is stopped or dropped, or when the manager is dropped.
    pub fn start_cleanup(self: &Arc<Self>) -> Result<CleanupTask> {
        CleanupTask::spawn(self, self.config.cleanup_interval, Duration::from_secs(1))
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    // ---- Write path ----

    /// Store `value` under `key`, replacing any previous envelope
    pub async fn set_item<T>(&self, key: &str, value: &T, options: SetOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        check_key(key)?;
        let value = serde_json::to_value(value)
            .map_err(|e| Error::serialization(format!("value of {key}: {e}")))?;

        let _guard = self.locks.lock(key).await;

        let now = self.now();
        let existing = self.resolve(key, false).await?;

        let envelope = Envelope {
            value,
            created: existing.as_ref().map_or(now, |e| e.created),
            updated: now,
            last_accessed: now,
            exp: options
                .expires_in
                .filter(|ttl| !ttl.is_zero())
                .map(|ttl| now.saturating_add(duration_ms(ttl))),
            compressed: options.compress,
            metadata: options.metadata,
        };

        self.backend.set(key, encode_envelope(key, &envelope)?).await?;

        if options.skip_cache {
            self.cache.remove(key);
        } else {
            let pruned = self.cache.insert(key, envelope.clone());
            if pruned > 0 {
                diag!(self, "Pruned {} items from memory cache", pruned);
            }
        }

        let new_index_keys: BTreeSet<String> = envelope.index_keys().into_iter().collect();
        if let Some(previous) = &existing {
            for stale in previous
                .index_keys()
                .into_iter()
                .filter(|ik| !new_index_keys.contains(ik))
            {
                self.index.remove(&stale, key).await?;
            }
        }
        for index_key in &new_index_keys {
            self.index.add(index_key, key).await?;
        }

        diag!(self, "set {} (exp={:?})", key, envelope.exp);
        Ok(())
    }

    // ---- Read path ----

    /// Value stored under `key`, or `None` if absent or expired
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        match self.resolve(key, true).await? {
            Some(envelope) => decode_value(key, envelope.value).map(Some),
            None => Ok(None),
        }
    }

    /// Value and metadata stored under `key`
    pub async fn get_item_with_metadata<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<ItemWithMetadata<T>>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        match self.resolve(key, true).await? {
            Some(envelope) => Ok(Some(ItemWithMetadata {
                value: decode_value(key, envelope.value)?,
                metadata: envelope.metadata,
            })),
            None => Ok(None),
        }
    }

    /// Read with up to `max_retries` retries on backend failure
    ///
    /// Exhausted retries and a genuinely absent key both yield `None`.
    pub async fn get_item_with_retry<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_item_with_retries(key, self.config.max_retries).await
    }

    /// Read with an explicit retry budget
    pub async fn get_item_with_retries<T: DeserializeOwned>(
        &self,
        key: &str,
        retries: u32,
    ) -> Option<T> {
        let mut remaining = retries;
        loop {
            match self.get_item(key).await {
                Ok(value) => return value,
                Err(e) if remaining > 0 && e.is_retryable() => {
                    remaining -= 1;
                    diag!(
                        self,
                        "Error getting item {}, retrying... ({} retries left): {}",
                        key,
                        remaining,
                        e
                    );
                }
                Err(e) => {
                    warn!(
                        "Failed to get item {} after {} attempts: {}",
                        key,
                        retries - remaining + 1,
                        e
                    );
                    return None;
                }
            }
        }
    }

    /// Live envelope for `key`; the caller holds the key lock
    ///
    /// With `touch`, a backend hit has its refreshed `lastAccessed` persisted
    /// and is placed in the memory cache.
    async fn resolve(&self, key: &str, touch: bool) -> Result<Option<Envelope>> {
        let now = self.now();

        if let Some(envelope) = self.cache.get(key, now) {
            if !envelope.is_expired(now) {
                return Ok(Some(envelope));
            }
            self.cache.remove(key);
        }

        let Some(mut envelope) = self.read_envelope(key).await? else {
            return Ok(None);
        };

        if envelope.is_expired(now) {
            diag!(self, "{} expired at {:?}, removing", key, envelope.exp);
            self.remove_locked(key, Some(envelope)).await?;
            return Ok(None);
        }

        if touch {
            envelope.last_accessed = now;
            self.backend.set(key, encode_envelope(key, &envelope)?).await?;
            self.cache.insert(key, envelope.clone());
        }
        Ok(Some(envelope))
    }

    async fn read_envelope(&self, key: &str) -> Result<Option<Envelope>> {
        match self.backend.get(key).await? {
            Some(raw) => serde_json::from_value(raw)
                .map(Some)
                .map_err(|e| Error::deserialization(format!("envelope {key}: {e}"))),
            None => Ok(None),
        }
    }

    // ---- Removal ----

    /// Delete `key` and its index references; absent keys are a no-op
    pub async fn remove_item(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        self.remove_locked(key, None).await
    }

    /// Remove from indices, cache and backend; the caller holds the key lock
    async fn remove_locked(&self, key: &str, known: Option<Envelope>) -> Result<()> {
        self.cache.remove(key);

        let envelope = match known {
            Some(envelope) => Some(envelope),
            None => self.read_envelope(key).await?,
        };
        if let Some(envelope) = envelope {
            for index_key in envelope.index_keys() {
                self.index.remove(&index_key, key).await?;
            }
        }

        self.backend.remove(key).await?;
        diag!(self, "removed {}", key);
        Ok(())
    }

    // ---- Queries ----

    /// Live entries whose metadata equals every field in `query`
    ///
    /// A single scalar constraint is answered from its index record; anything
    /// else scans the whole key space.
    pub async fn query_by_metadata<T: DeserializeOwned>(
        &self,
        query: &Metadata,
    ) -> Result<Vec<QueryHit<T>>> {
        if query.len() == 1
            && let Some((field, expected)) = query.iter().next()
            && let Some(index_key) = index_key(field, expected)
        {
            return self.query_indexed(&index_key, query).await;
        }

        diag!(self, "query {:?}: scanning all keys", query);
        let mut hits = Vec::new();
        for (key, envelope) in self.get_all_items().await? {
            if envelope.matches(query) {
                hits.push(QueryHit {
                    value: decode_value(&key, envelope.value)?,
                    key,
                });
            }
        }
        Ok(hits)
    }

    async fn query_indexed<T: DeserializeOwned>(
        &self,
        index_key: &str,
        query: &Metadata,
    ) -> Result<Vec<QueryHit<T>>> {
        let members = self.index.members(index_key).await?;
        diag!(self, "query via {} ({} candidates)", index_key, members.len());

        let mut hits = Vec::with_capacity(members.len());
        for key in members {
            let envelope = {
                let _guard = self.locks.lock(&key).await;
                self.resolve(&key, true).await?
            };
            // "1" and 1 share an index record; keep exact matches only
            if let Some(envelope) = envelope.filter(|e| e.matches(query)) {
                hits.push(QueryHit {
                    value: decode_value(&key, envelope.value)?,
                    key,
                });
            }
        }
        Ok(hits)
    }

    /// Every live envelope, keyed by primary key
    ///
    /// Expired envelopes met along the way are removed. Scanning does not
    /// count as an access, so `lastAccessed` is left as is.
    pub async fn get_all_items(&self) -> Result<Vec<(String, Envelope)>> {
        let keys = self.backend.keys().await?;
        let mut items = Vec::new();
        for key in keys.into_iter().filter(|k| !is_index_key(k)) {
            let envelope = {
                let _guard = self.locks.lock(&key).await;
                match self.resolve(&key, false).await {
                    Ok(envelope) => envelope,
                    Err(Error::Deserialization(msg)) => {
                        warn!("Skipping unreadable entry {}: {}", key, msg);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };
            if let Some(envelope) = envelope {
                items.push((key, envelope));
            }
        }
        Ok(items)
    }

    // ---- Expiration ----

    /// Remove every envelope that is expired at sweep time
    pub async fn clean_expired_items(&self) -> Result<SweepReport> {
        let start = Instant::now();
        let now = self.now();
        let mut report = SweepReport::default();

        let keys = self.backend.keys().await?;
        for key in keys.into_iter().filter(|k| !is_index_key(k)) {
            report.scanned += 1;

            let envelope = match self.read_envelope(&key).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(Error::Deserialization(msg)) => {
                    warn!("Skipping unreadable entry during cleanup: {}", msg);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !envelope.is_expired(now) {
                continue;
            }

            // Re-check under the lock: the key may have been rewritten since
            let _guard = self.locks.lock(&key).await;
            if let Some(current) = self.read_envelope(&key).await?
                && current.is_expired(now)
            {
                self.remove_locked(&key, Some(current)).await?;
                report.removed += 1;
            }
        }

        report.duration = start.elapsed();
        diag!(
            self,
            "Cleaned {} expired items in {:?}",
            report.removed,
            report.duration
        );
        Ok(report)
    }

    /// Evict the least recently accessed cache entries down to the limit
    pub fn prune_memory_cache(&self) -> usize {
        let pruned = self.cache.prune();
        if pruned > 0 {
            diag!(self, "Pruned {} items from memory cache", pruned);
        }
        pruned
    }

    /// Sweep expired entries and prune the cache
    ///
    /// Returns `None` without doing anything if a sweep is already running.
    /// A failing sweep is logged, not propagated; the cache is still pruned.
    pub async fn trigger_cleanup(&self) -> Option<SweepReport> {
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            diag!(self, "cleanup already running, skipping");
            return None;
        }
        let _flag = SweepFlag(&self.cleaning);

        let mut report = match self.clean_expired_items().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Error during cleanup: {}", e);
                SweepReport::default()
            }
        };
        report.pruned = self.prune_memory_cache();
        diag!(
            self,
            "Cache after cleanup: {} entries, hit ratio {:.2}",
            self.cache.len(),
            self.cache.stats().hit_ratio()
        );
        Some(report)
    }

    /// Check whether a sweep is in flight
    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::Acquire)
    }

    // ---- Bulk operations ----

    /// Store every entry concurrently; the first failure is returned
    ///
    /// There is no atomicity across the batch: entries that completed before
    /// a failure stay written.
    pub async fn bulk_set<T: Serialize>(&self, entries: Vec<BulkEntry<T>>) -> Result<()> {
        try_join_all(entries.into_iter().map(|entry| async move {
            let (key, value, options) = entry.into_parts();
            self.set_item(&key, &value, options).await
        }))
        .await?;
        Ok(())
    }

    /// Read every key concurrently; absent keys map to `None`
    pub async fn bulk_get<T, K>(&self, keys: &[K]) -> Result<HashMap<String, Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let values = try_join_all(keys.iter().map(|key| async move {
            let key = key.as_ref();
            self.get_item::<T>(key).await.map(|v| (key.to_string(), v))
        }))
        .await?;
        Ok(values.into_iter().collect())
    }

    /// `bulk_get` followed by a caller-supplied step over the result
    pub async fn bulk_process<T, K, R, F, Fut>(&self, keys: &[K], processor: F) -> Result<R>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
        F: FnOnce(HashMap<String, Option<T>>) -> Fut,
        Fut: Future<Output = R>,
    {
        let items = self.bulk_get::<T, K>(keys).await?;
        Ok(processor(items).await)
    }

    // ---- Key space ----

    /// Live user keys, in backend order; index records are never included
    ///
    /// A read-only peek: expired envelopes are skipped, not removed.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let now = self.now();
        let mut live = Vec::new();
        for key in self.backend.keys().await? {
            if is_index_key(&key) {
                continue;
            }
            match self.read_envelope(&key).await {
                Ok(Some(envelope)) if !envelope.is_expired(now) => live.push(key),
                Ok(_) => {}
                Err(Error::Deserialization(msg)) => {
                    warn!("Skipping unreadable entry {}: {}", key, msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    /// Number of live user keys
    pub async fn length(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    /// The `n`-th live user key
    pub async fn key(&self, n: usize) -> Result<Option<String>> {
        Ok(self.keys().await?.into_iter().nth(n))
    }

    /// Empty the backend, the memory cache and the index cache
    pub async fn clear(&self) -> Result<()> {
        self.index.clear_cache();
        self.cache.clear();
        self.backend.clear().await?;
        info!("Cleared {} storage", self.backend.name());
        Ok(())
    }

    // ---- Introspection ----

    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Number of envelopes currently in the memory cache
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Check whether `key` is held in the memory cache
    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    /// Number of index records held in the index cache
    pub fn index_cache_len(&self) -> usize {
        self.index.cached_len()
    }

    /// Number of keys with an operation in flight or queued
    pub fn pending_operations(&self) -> usize {
        self.locks.pending()
    }
}

/// Index records live in the same key space; callers may not address them
fn check_key(key: &str) -> Result<()> {
    if is_index_key(key) {
        return Err(Error::invalid_key(format!(
            "'{key}' is in the reserved {INDEX_PREFIX} namespace"
        )));
    }
    Ok(())
}

fn duration_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn encode_envelope(key: &str, envelope: &Envelope) -> Result<serde_json::Value> {
    serde_json::to_value(envelope).map_err(|e| Error::serialization(format!("envelope {key}: {e}")))
}

fn decode_value<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::deserialization(format!("value of {key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::{Value, json};
    use stashio_common::MockClock;

    fn manager(limit: usize) -> (Arc<MemoryBackend>, MockClock, StorageManager) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = MockClock::new(1_000_000);
        let config = StoreConfig::default().with_memory_cache_limit(limit);
        let manager = StorageManager::with_clock(backend.clone(), config, Arc::new(clock.clone()));
        (backend, clock, manager)
    }

    async fn raw_envelope(backend: &MemoryBackend, key: &str) -> Envelope {
        serde_json::from_value(backend.get(key).await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_set_writes_envelope() {
        let (backend, _clock, manager) = manager(10);

        manager
            .set_item(
                "doc",
                &json!({"title": "hello"}),
                SetOptions::new()
                    .meta("type", "invoice")
                    .expires_in(Duration::from_secs(60))
                    .compress(true),
            )
            .await
            .unwrap();

        let env = raw_envelope(&backend, "doc").await;
        assert_eq!(env.value, json!({"title": "hello"}));
        assert_eq!(env.created, 1_000_000);
        assert_eq!(env.updated, 1_000_000);
        assert_eq!(env.exp, Some(1_060_000));
        assert_eq!(env.compressed, Some(true));
        assert_eq!(env.metadata.unwrap()["type"], json!("invoice"));
        assert_eq!(
            backend.get("__index_type:invoice").await.unwrap(),
            Some(json!(["doc"]))
        );
    }

    #[tokio::test]
    async fn test_overwrite_preserves_created() {
        let (backend, clock, manager) = manager(10);

        manager.set_item("k", "v1", SetOptions::new()).await.unwrap();
        clock.advance(Duration::from_secs(5));
        manager.set_item("k", "v2", SetOptions::new()).await.unwrap();

        let env = raw_envelope(&backend, "k").await;
        assert_eq!(env.value, json!("v2"));
        assert_eq!(env.created, 1_000_000);
        assert_eq!(env.updated, 1_005_000);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (backend, clock, manager) = manager(10);

        manager
            .set_item("k", &1, SetOptions::new().expires_in(Duration::ZERO))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3600));

        assert_eq!(raw_envelope(&backend, "k").await.exp, None);
        assert_eq!(manager.get_item::<i32>("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_backend_hit_refreshes_last_accessed_and_caches() {
        let (backend, clock, manager) = manager(10);

        manager
            .set_item("k", "v", SetOptions::new().skip_cache())
            .await
            .unwrap();
        assert!(!manager.is_cached("k"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(manager.get_item::<String>("k").await.unwrap().as_deref(), Some("v"));

        assert!(manager.is_cached("k"));
        assert_eq!(raw_envelope(&backend, "k").await.last_accessed, 1_001_000);
    }

    #[tokio::test]
    async fn test_skip_cache_drops_stale_copy() {
        let (_backend, _clock, manager) = manager(10);

        manager.set_item("k", "old", SetOptions::new()).await.unwrap();
        assert!(manager.is_cached("k"));

        manager
            .set_item("k", "new", SetOptions::new().skip_cache())
            .await
            .unwrap();
        assert!(!manager.is_cached("k"));
        assert_eq!(
            manager.get_item::<String>("k").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_expired_read_removes_everywhere() {
        let (backend, clock, manager) = manager(10);

        manager
            .set_item(
                "k",
                "v",
                SetOptions::new()
                    .expires_in(Duration::from_secs(10))
                    .meta("tag", "temp"),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(11));
        assert_eq!(manager.get_item::<String>("k").await.unwrap(), None);

        assert!(!manager.is_cached("k"));
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.get("__index_tag:temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metadata_change_moves_index_membership() {
        let (backend, _clock, manager) = manager(10);

        manager
            .set_item("p", &1, SetOptions::new().meta("color", "red"))
            .await
            .unwrap();
        manager
            .set_item("p", &1, SetOptions::new().meta("color", "blue"))
            .await
            .unwrap();

        assert_eq!(backend.get("__index_color:red").await.unwrap(), None);
        assert_eq!(
            backend.get("__index_color:blue").await.unwrap(),
            Some(json!(["p"]))
        );

        let mut query = Metadata::new();
        query.insert("color".into(), json!("red"));
        assert!(manager.query_by_metadata::<i32>(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_query_checks_value_type() {
        let (_backend, _clock, manager) = manager(10);

        manager
            .set_item("num", &1, SetOptions::new().meta("v", 1))
            .await
            .unwrap();
        manager
            .set_item("text", &2, SetOptions::new().meta("v", "1"))
            .await
            .unwrap();

        let mut query = Metadata::new();
        query.insert("v".into(), json!(1));
        let hits = manager.query_by_metadata::<i32>(&query).await.unwrap();
        assert_eq!(hits, vec![QueryHit { key: "num".into(), value: 1 }]);
    }

    #[tokio::test]
    async fn test_non_scalar_metadata_not_indexed() {
        let (backend, _clock, manager) = manager(10);

        manager
            .set_item(
                "k",
                "v",
                SetOptions::new().meta("tags", json!(["a", "b"])).meta("ok", true),
            )
            .await
            .unwrap();

        let keys = backend.keys().await.unwrap();
        assert_eq!(keys, vec!["k"]);

        let item = manager
            .get_item_with_metadata::<String>("k")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.metadata.unwrap()["tags"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_wrong_type_is_deserialization_error() {
        let (_backend, _clock, manager) = manager(10);
        manager.set_item("k", "text", SetOptions::new()).await.unwrap();

        let err = manager.get_item::<u64>("k").await.unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
        assert_eq!(manager.get_item_with_retry::<u64>("k").await, None);
    }

    #[tokio::test]
    async fn test_cache_limit_enforced_on_write() {
        let (_backend, clock, manager) = manager(2);

        for key in ["a", "b", "c"] {
            manager.set_item(key, key, SetOptions::new()).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(manager.cache_len(), 2);
        assert!(!manager.is_cached("a"));
        assert_eq!(
            manager.get_item::<String>("a").await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_keys_peek_skips_expired_without_removing() {
        let (backend, clock, manager) = manager(10);

        manager.set_item("live", &1, SetOptions::new()).await.unwrap();
        manager
            .set_item("short", &2, SetOptions::new().expires_in(Duration::from_secs(1)))
            .await
            .unwrap();
        manager
            .set_item("m", &3, SetOptions::new().meta("f", "x"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));

        assert_eq!(manager.keys().await.unwrap(), vec!["live", "m"]);
        assert_eq!(manager.length().await.unwrap(), 2);
        assert_eq!(manager.key(1).await.unwrap().as_deref(), Some("m"));
        assert_eq!(manager.key(2).await.unwrap(), None);
        assert!(backend.get("short").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clean_expired_items_report() {
        let (backend, clock, manager) = manager(10);

        for i in 0..4 {
            let ttl = Duration::from_secs(if i % 2 == 0 { 5 } else { 500 });
            manager
                .set_item(&format!("k{i}"), &i, SetOptions::new().expires_in(ttl).meta("g", "all"))
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(10));

        let report = manager.clean_expired_items().await.unwrap();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.removed, 2);
        assert_eq!(
            backend.get("__index_g:all").await.unwrap(),
            Some(json!(["k1", "k3"]))
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_unreadable_entries() {
        let (backend, _clock, manager) = manager(10);
        backend.set("foreign", Value::from(42)).await.unwrap();
        manager
            .set_item("a", &1, SetOptions::new().meta("f", "x").meta("g", "y"))
            .await
            .unwrap();

        let report = manager.clean_expired_items().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 0);

        assert_eq!(manager.keys().await.unwrap(), vec!["a"]);
        assert_eq!(manager.length().await.unwrap(), 1);
        assert_eq!(manager.key(0).await.unwrap().as_deref(), Some("a"));

        let mut query = Metadata::new();
        query.insert("f".into(), json!("x"));
        query.insert("g".into(), json!("y"));
        let hits = manager.query_by_metadata::<i32>(&query).await.unwrap();
        assert_eq!(hits, vec![QueryHit { key: "a".into(), value: 1 }]);
    }

    #[tokio::test]
    async fn test_index_namespace_keys_rejected() {
        let (backend, _clock, manager) = manager(10);
        manager
            .set_item("p", &1, SetOptions::new().meta("color", "red"))
            .await
            .unwrap();

        let set = tokio::time::timeout(
            Duration::from_secs(2),
            manager.set_item("__index_color:red", &1, SetOptions::new().meta("color", "red")),
        )
        .await
        .expect("set on a reserved key must not hang");
        assert!(matches!(set, Err(Error::InvalidKey(_))));

        assert!(matches!(
            manager.get_item::<Value>("__index_color:red").await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            manager.get_item_with_metadata::<Value>("__index_color:red").await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            manager.remove_item("__index_color:red").await,
            Err(Error::InvalidKey(_))
        ));
        assert_eq!(manager.get_item_with_retry::<Value>("__index_color:red").await, None);

        assert_eq!(
            backend.get("__index_color:red").await.unwrap(),
            Some(json!(["p"]))
        );
        assert_eq!(manager.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_trigger_cleanup_prunes_and_resets_flag() {
        let (_backend, _clock, manager) = manager(10);
        manager.set_item("a", &1, SetOptions::new()).await.unwrap();

        let report = manager.trigger_cleanup().await.unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.pruned, 0);
        assert!(!manager.is_cleaning());
        assert!(manager.trigger_cleanup().await.is_some());
    }

    #[tokio::test]
    async fn test_bulk_process() {
        let (_backend, _clock, manager) = manager(10);
        manager
            .bulk_set(vec![BulkEntry::new("a", 1), BulkEntry::new("b", 2)])
            .await
            .unwrap();

        let total = manager
            .bulk_process(&["a", "b", "missing"], |items: HashMap<String, Option<i64>>| async move {
                items.values().flatten().sum::<i64>()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_clear_resets_caches() {
        let (backend, _clock, manager) = manager(10);
        manager
            .set_item("a", &1, SetOptions::new().meta("f", "v"))
            .await
            .unwrap();
        assert_eq!(manager.index_cache_len(), 1);

        manager.clear().await.unwrap();
        assert_eq!(manager.cache_len(), 0);
        assert_eq!(manager.index_cache_len(), 0);
        assert_eq!(backend.raw_len(), 0);

        assert_eq!(manager.get_item::<i32>("a").await.unwrap(), None);
        let mut query = Metadata::new();
        query.insert("f".into(), json!("v"));
        assert!(manager.query_by_metadata::<i32>(&query).await.unwrap().is_empty());
    }
}
