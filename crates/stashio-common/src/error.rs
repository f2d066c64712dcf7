//! Error types for StashIO
//!
//! Absence of a key is never an error: reads return `Ok(None)`.

use thiserror::Error;

/// Common result type for StashIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StashIO
#[derive(Debug, Error)]
pub enum Error {
    /// Any failure surfaced by the underlying storage backend
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key rejected before reaching the backend
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error (backend failures only)
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::backend("quota exceeded").is_retryable());
        assert!(!Error::Serialization("bad".into()).is_retryable());
        assert!(!Error::configuration("zero interval").is_retryable());
        assert!(!Error::invalid_key("__index_x:1").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::backend("disk gone");
        assert_eq!(err.to_string(), "backend error: disk gone");
    }
}
