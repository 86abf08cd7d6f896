//! Versioned blob persistence boundary.
//!
//! The checkpoint store talks to durable storage only through
//! [`VersionedBlobStore`]; backends (in-memory, object store, database)
//! plug in behind [`DynBlobStore`] without the orchestration core knowing.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Result alias for blob-store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures at the persistence boundary.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// A put at a version that is not strictly greater than every stored
    /// version for the key.
    #[error("Version conflict on '{key}': version {version} is not newer than the latest")]
    VersionConflict { key: String, version: u64 },

    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (connection, query, I/O).
    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Append-only, versioned blob storage.
///
/// Writes are atomic: after `put` returns Ok the blob is fully visible at
/// that version, and a failed `put` leaves nothing behind. Versions for one
/// key are strictly increasing; the store rejects any put at or below the
/// current latest.
#[async_trait]
pub trait VersionedBlobStore: Send + Sync {
    /// Commit `bytes` at exactly `version`. `version` must be strictly
    /// greater than every version already stored for `key`.
    async fn put(&self, key: &str, version: u64, bytes: Vec<u8>) -> StorageResult<()>;

    /// Fetch one specific version, if present.
    async fn get(&self, key: &str, version: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Fetch the highest-versioned blob for `key`.
    async fn get_latest(&self, key: &str) -> StorageResult<Option<(u64, Vec<u8>)>>;

    /// All stored versions for `key`, ascending.
    async fn list_versions(&self, key: &str) -> StorageResult<Vec<u64>>;

    /// Drop versions strictly below `version`; returns how many were
    /// removed. Pruning never touches the latest version.
    async fn delete_before(&self, key: &str, version: u64) -> StorageResult<usize>;
}

/// Shared handle to a blob-store backend.
pub type DynBlobStore = Arc<dyn VersionedBlobStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StorageError::VersionConflict {
            key: "session:abc".into(),
            version: 3,
        };
        assert!(err.to_string().contains("session:abc"));
        assert!(err.to_string().contains('3'));

        let err = StorageError::backend("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn serde_error_converts_via_from() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StorageError = bad.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
