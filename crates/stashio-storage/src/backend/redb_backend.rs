//! Persistent backend backed by redb.
//!
//! One table maps string keys to JSON-encoded values. Every write is its own
//! write transaction + commit; redb calls run on the blocking thread pool.

use super::StorageBackend;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use stashio_common::{Error, Result};
use std::path::Path;
use std::sync::Arc;

/// Key: user or index key, Value: JSON bytes
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Backend persisting every record in a redb database file
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::backend(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let db = Database::create(path).map_err(redb_err)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(redb_err)?;
        {
            let _t = write_txn.open_table(ENTRIES).map_err(redb_err)?;
        }
        write_txn.commit().map_err(redb_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> std::result::Result<T, redb::Error> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| Error::internal(format!("redb task failed: {e}")))?
            .map_err(redb_err)
    }
}

fn redb_err(e: impl Into<redb::Error>) -> Error {
    Error::backend(format!("redb: {}", e.into()))
}

#[async_trait]
impl StorageBackend for RedbBackend {
    fn name(&self) -> &str {
        "redb"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        let bytes = self
            .run(move |db| {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(ENTRIES)?;
                Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
            })
            .await?;

        bytes
            .map(|b| serde_json::from_slice(&b).map_err(|e| Error::deserialization(e.to_string())))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<Value> {
        let key = key.to_string();
        let bytes = serde_json::to_vec(&value).map_err(|e| Error::serialization(e.to_string()))?;
        self.run(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(ENTRIES)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        Ok(value)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.run(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(ENTRIES)?;
                table.remove(key.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.run(|db| {
            let write_txn = db.begin_write()?;
            write_txn.delete_table(ENTRIES)?;
            {
                let _t = write_txn.open_table(ENTRIES)?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.run(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(ENTRIES)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }
            Ok(keys)
        })
        .await
    }
}
