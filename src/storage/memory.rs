//! Process-local blob store.
//!
//! Survives engine restarts within one process (clone the `Arc` and build a
//! second engine), which is what the restart tests rely on.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::KeyValueStore;
use crate::error::SyncResult;

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs across all namespaces
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> SyncResult<Option<String>> {
        Ok(self
            .blobs
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> SyncResult<()> {
        self.blobs
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> SyncResult<()> {
        self.blobs
            .write()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}
