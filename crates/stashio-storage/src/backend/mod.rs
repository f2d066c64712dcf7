//! Storage backends
//!
//! A backend is a flat, string-keyed store of JSON values. It knows nothing
//! about envelopes, expiry or indices; the manager layers those on top.
//! Every operation may fail, and failures propagate to the manager's callers
//! unchanged.

mod memory;
mod redb_backend;

pub use self::memory::MemoryBackend;
pub use self::redb_backend::RedbBackend;

use async_trait::async_trait;
use serde_json::Value;
use stashio_common::Result;

/// Asynchronous key/value store underneath the storage manager
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Fetch a value, `None` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, returning what was stored
    async fn set(&self, key: &str, value: Value) -> Result<Value>;

    /// Delete a key; deleting an absent key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Delete every key
    async fn clear(&self) -> Result<()>;

    /// Every stored key, in the backend's enumeration order
    async fn keys(&self) -> Result<Vec<String>>;
}
