//! Secondary metadata indices
//!
//! One backend record per metadata field/value pair, stored under
//! `__index_<field>:<value>` as a sorted JSON array of primary keys. An
//! in-memory copy of every record seen so far avoids re-reading it.
//!
//! Writers of a record hold the per-key lock of the index key itself, so two
//! primary keys sharing a field/value pair cannot lose each other's update.
//! Updates to different records are independent; there is no atomicity
//! across the several records touched by one envelope.

use crate::backend::StorageBackend;
use crate::lock::KeyLocks;
use parking_lot::Mutex;
use serde_json::Value;
use stashio_common::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

type KeySet = BTreeSet<String>;

/// Index records plus their cache
pub struct IndexStore {
    backend: Arc<dyn StorageBackend>,
    locks: Arc<KeyLocks>,
    cache: Mutex<HashMap<String, KeySet>>,
}

impl IndexStore {
    pub fn new(backend: Arc<dyn StorageBackend>, locks: Arc<KeyLocks>) -> Self {
        Self {
            backend,
            locks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Primary keys recorded under an index key
    pub async fn members(&self, index_key: &str) -> Result<KeySet> {
        if let Some(keys) = self.cache.lock().get(index_key) {
            return Ok(keys.clone());
        }

        // Cache fills happen under the record's lock, same as add and remove
        let _guard = self.locks.lock(index_key).await;
        let keys = self.current(index_key).await?;
        self.cache.lock().insert(index_key.to_string(), keys.clone());
        Ok(keys)
    }

    /// Record `key` under `index_key`
    pub async fn add(&self, index_key: &str, key: &str) -> Result<()> {
        let _guard = self.locks.lock(index_key).await;

        let mut keys = self.current(index_key).await?;
        if keys.insert(key.to_string()) {
            self.persist(index_key, &keys).await?;
            trace!("index {} += {}", index_key, key);
        }
        self.cache.lock().insert(index_key.to_string(), keys);
        Ok(())
    }

    /// Drop `key` from `index_key`, deleting the record once it is empty
    pub async fn remove(&self, index_key: &str, key: &str) -> Result<()> {
        let _guard = self.locks.lock(index_key).await;

        let mut keys = self.current(index_key).await?;
        if !keys.remove(key) {
            return Ok(());
        }

        if keys.is_empty() {
            self.backend.remove(index_key).await?;
            self.cache.lock().remove(index_key);
        } else {
            self.persist(index_key, &keys).await?;
            self.cache.lock().insert(index_key.to_string(), keys);
        }
        trace!("index {} -= {}", index_key, key);
        Ok(())
    }

    /// Forget every cached record (the backend is left alone)
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Number of cached index records
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    async fn current(&self, index_key: &str) -> Result<KeySet> {
        let cached = self.cache.lock().get(index_key).cloned();
        match cached {
            Some(keys) => Ok(keys),
            None => self.load(index_key).await,
        }
    }

    async fn load(&self, index_key: &str) -> Result<KeySet> {
        match self.backend.get(index_key).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::deserialization(format!("corrupt index record {index_key}: {e}"))
            }),
            None => Ok(KeySet::new()),
        }
    }

    async fn persist(&self, index_key: &str, keys: &KeySet) -> Result<()> {
        let value = Value::from(keys.iter().cloned().collect::<Vec<_>>());
        self.backend.set(index_key, value).await?;
        Ok(())
    }
}
