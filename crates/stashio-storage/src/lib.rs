//! StashIO Storage - key/value storage manager
//!
//! This crate layers a [`StorageManager`] over any [`StorageBackend`]:
//! - Envelopes with timestamps, expiry and metadata
//! - Bounded in-memory read cache (oldest-access eviction)
//! - Secondary indices for metadata equality queries
//! - Per-key serialization of operations
//! - Expiration sweeps, on demand or from a caller-owned cleanup task

pub mod backend;
pub mod cache;
pub mod cleanup;
pub mod index;
pub mod lock;
pub mod manager;

// Re-exports
pub use backend::{MemoryBackend, RedbBackend, StorageBackend};
pub use cache::{CacheStats, MemoryCache};
pub use cleanup::CleanupTask;
pub use index::IndexStore;
pub use lock::{KeyGuard, KeyLocks};
pub use manager::{StorageManager, SweepReport};
