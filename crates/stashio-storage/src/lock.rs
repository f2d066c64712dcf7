//! Per-key operation serialization
//!
//! Each key maps to a fair async mutex, so operations on one key run one at
//! a time in the order they were issued while operations on different keys
//! proceed concurrently. A [`KeyGuard`] releases its key on drop, on every
//! exit path, and removes the map entry once nobody else holds or waits on it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type KeyMutex = Arc<Mutex<()>>;

/// Table of per-key locks
#[derive(Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<String, KeyMutex>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every earlier operation on `key` has finished, then hold it
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = Arc::clone(&mutex).lock_owned().await;

        KeyGuard {
            key: key.to_string(),
            mutex,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with an operation in flight or queued
    pub fn pending(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive hold on one key
pub struct KeyGuard {
    key: String,
    mutex: KeyMutex,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, KeyMutex>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Only the map and this guard still reference the mutex: no waiters.
        // Acquirers clone under the same shard lock, so this check cannot race.
        self.locks.remove_if(&self.key, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_issue_order() {
        let locks = Arc::new(KeyLocks::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.lock("k").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = Arc::clone(&locks);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("k").await;
                log.lock().push(i);
            }));
            // Let the task enqueue before spawning the next one
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(log.lock().is_empty());
        drop(first);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(locks.pending(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::new();

        let a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b"))
            .await
            .expect("lock on another key must not wait");

        assert_eq!(locks.pending(), 2);

        drop(a);
        drop(b);
        assert_eq!(locks.pending(), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_while_waiter_queued() {
        let locks = Arc::new(KeyLocks::new());
        let held = locks.lock("k").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        assert_eq!(locks.pending(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.pending(), 0);
    }
}
