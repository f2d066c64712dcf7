//! Core types for StashIO
//!
//! The [`Envelope`] is what actually lands in the backend: the caller's value
//! plus lifecycle timestamps, an optional expiry, and optional metadata used
//! for indexed queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Prefix of backend keys holding secondary index records
pub const INDEX_PREFIX: &str = "__index_";

/// User-supplied metadata attached to an envelope
pub type Metadata = BTreeMap<String, Value>;

/// Persisted wrapper around a user value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Opaque payload
    pub value: Value,
    /// First write time (ms since epoch), preserved across overwrites
    pub created: u64,
    /// Last write time (ms since epoch)
    pub updated: u64,
    /// Last read or write time (ms since epoch)
    #[serde(default)]
    pub last_accessed: u64,
    /// Absolute expiry (ms since epoch); `None` never expires
    #[serde(default)]
    pub exp: Option<u64>,
    /// Informational only; values are stored as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Envelope {
    /// Expired iff an expiry is set and `now` is strictly past it
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        match self.exp {
            Some(exp) => now_ms > exp,
            None => false,
        }
    }

    /// Index keys for every scalar metadata field
    pub fn index_keys(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .map(|metadata| {
                metadata
                    .iter()
                    .filter_map(|(field, value)| index_key(field, value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check that every constraint is present with an equal value
    pub fn matches(&self, query: &Metadata) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        query
            .iter()
            .all(|(field, expected)| metadata.get(field) == Some(expected))
    }
}

/// Text form of an indexable metadata value (strings and numbers only)
pub fn scalar_repr(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Backend key of the index record for a metadata field/value pair
///
/// Returns `None` for values that are not indexed.
pub fn index_key(field: &str, value: &Value) -> Option<String> {
    scalar_repr(value).map(|repr| format!("{INDEX_PREFIX}{field}:{repr}"))
}

/// Check whether a backend key belongs to the index namespace
pub fn is_index_key(key: &str) -> bool {
    key.starts_with(INDEX_PREFIX)
}

/// Options for `set_item`
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Lifetime from now; `None` or zero never expires
    pub expires_in: Option<Duration>,
    pub compress: Option<bool>,
    pub metadata: Option<Metadata>,
    /// Write to the backend without touching the memory cache
    pub skip_cache: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    #[must_use]
    pub const fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Add a single metadata field
    #[must_use]
    pub fn meta(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub const fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

/// Value and metadata of a live entry
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWithMetadata<T> {
    pub value: T,
    pub metadata: Option<Metadata>,
}

/// One result of a metadata query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit<T> {
    pub key: String,
    pub value: T,
}

/// One entry of a `bulk_set` batch
#[derive(Debug, Clone)]
pub struct BulkEntry<T> {
    pub key: String,
    pub value: T,
    pub expires_in: Option<Duration>,
    pub compress: Option<bool>,
    pub metadata: Option<Metadata>,
}

impl<T> BulkEntry<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
            expires_in: None,
            compress: None,
            metadata: None,
        }
    }

    #[must_use]
    pub const fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Split into key, value and the options `set_item` expects
    pub fn into_parts(self) -> (String, T, SetOptions) {
        let options = SetOptions {
            expires_in: self.expires_in,
            compress: self.compress,
            metadata: self.metadata,
            skip_cache: false,
        };
        (self.key, self.value, options)
    }
}
