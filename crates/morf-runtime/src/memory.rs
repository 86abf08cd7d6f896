//! In-memory blob store.
//!
//! Thread-safe backend for tests, development, and short-lived deployments
//! where checkpoints do not need to outlive the process. Implements the
//! full version-ordering contract, so higher layers behave identically
//! against a durable backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use morf_kernel::storage::{StorageError, StorageResult, VersionedBlobStore};

/// Blob store holding everything in process memory.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop every key and version.
    pub async fn clear(&self) {
        self.blobs.write().await.clear();
    }

    pub async fn key_count(&self) -> usize {
        self.blobs.read().await.len()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionedBlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, version: u64, bytes: Vec<u8>) -> StorageResult<()> {
        let mut blobs = self.blobs.write().await;
        let versions = blobs.entry(key.to_string()).or_default();
        if let Some((&latest, _)) = versions.last_key_value() {
            if version <= latest {
                return Err(StorageError::VersionConflict {
                    key: key.to_string(),
                    version,
                });
            }
        }
        versions.insert(version, bytes);
        Ok(())
    }

    async fn get(&self, key: &str, version: u64) -> StorageResult<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(key).and_then(|v| v.get(&version).cloned()))
    }

    async fn get_latest(&self, key: &str) -> StorageResult<Option<(u64, Vec<u8>)>> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .get(key)
            .and_then(|v| v.last_key_value())
            .map(|(version, bytes)| (*version, bytes.clone())))
    }

    async fn list_versions(&self, key: &str) -> StorageResult<Vec<u64>> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .get(key)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete_before(&self, key: &str, version: u64) -> StorageResult<usize> {
        let mut blobs = self.blobs.write().await;
        let Some(versions) = blobs.get_mut(key) else {
            return Ok(0);
        };
        let retained = versions.split_off(&version);
        let removed = versions.len();
        *versions = retained;
        Ok(removed)
    }
}
