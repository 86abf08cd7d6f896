//! Checkpoint store: the typed layer between sessions and the blob
//! boundary.
//!
//! Checkpoints are JSON-encoded and committed at the session version they
//! snapshot, so the blob store's version ordering directly enforces the
//! no-gaps, no-duplicates guarantee. Recovery reads only the latest
//! version; `list` and `get` exist for audit and inspection.

use std::sync::Arc;
use tracing::debug;

use morf_kernel::session::Checkpoint;
use morf_kernel::storage::{DynBlobStore, StorageResult};

use crate::memory::MemoryBlobStore;

pub struct CheckpointStore {
    store: DynBlobStore,
}

impl CheckpointStore {
    pub fn new(store: DynBlobStore) -> Self {
        Self { store }
    }

    /// Store backed by process memory; suits tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self::new(MemoryBlobStore::shared())
    }

    fn key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Commit a checkpoint at its own version. Returns the committed
    /// version; rejects anything at or below the session's latest.
    pub async fn put(&self, checkpoint: &Checkpoint) -> StorageResult<u64> {
        let bytes = serde_json::to_vec(checkpoint)?;
        self.store
            .put(&Self::key(&checkpoint.session_id), checkpoint.version, bytes)
            .await?;
        debug!(
            session_id = %checkpoint.session_id,
            version = checkpoint.version,
            state = %checkpoint.state,
            "checkpoint committed"
        );
        Ok(checkpoint.version)
    }

    /// The highest-versioned checkpoint for a session.
    pub async fn get_latest(&self, session_id: &str) -> StorageResult<Option<Checkpoint>> {
        match self.store.get_latest(&Self::key(session_id)).await? {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, session_id: &str, version: u64) -> StorageResult<Option<Checkpoint>> {
        match self.store.get(&Self::key(session_id), version).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All retained checkpoints, ascending by version.
    pub async fn list(&self, session_id: &str) -> StorageResult<Vec<Checkpoint>> {
        let key = Self::key(session_id);
        let mut checkpoints = Vec::new();
        for version in self.store.list_versions(&key).await? {
            if let Some(bytes) = self.store.get(&key, version).await? {
                checkpoints.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(checkpoints)
    }

    /// Retain only the `keep_last` most recent checkpoints. The latest is
    /// always retained, so recovery is unaffected. Returns how many were
    /// dropped.
    pub async fn prune(&self, session_id: &str, keep_last: usize) -> StorageResult<usize> {
        let key = Self::key(session_id);
        let versions = self.store.list_versions(&key).await?;
        let keep_last = keep_last.max(1);
        if versions.len() <= keep_last {
            return Ok(0);
        }
        let cutoff = versions[versions.len() - keep_last];
        let removed = self.store.delete_before(&key, cutoff).await?;
        debug!(session_id, removed, cutoff, "pruned checkpoints");
        Ok(removed)
    }
}

impl Clone for CheckpointStore {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}
