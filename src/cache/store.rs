//! Durable cache store
//!
//! One blob per (identity, collection) plus a per-identity index of the
//! collections written, so an identity's whole cache can be invalidated
//! without a key scan. Entries are loaded lazily and kept in memory.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::entry::CacheEntry;
use crate::error::SyncResult;
use crate::notify::{ChangeEvent, ChangeNotifier};
use crate::storage::{codec, KeyValueStore};

const NAMESPACE: &str = "caresync.cache";

type CacheKey = (String, String);

fn entry_key(identity: &str, collection: &str) -> String {
    format!("entry/{}/{}", identity, collection)
}

fn index_key(identity: &str) -> String {
    format!("index/{}", identity)
}

pub struct CacheStore {
    storage: Arc<dyn KeyValueStore>,
    notifier: ChangeNotifier,
    /// Loaded entries; `None` remembers that nothing is stored
    entries: RwLock<HashMap<CacheKey, Option<CacheEntry>>>,
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, notifier: ChangeNotifier) -> Self {
        Self {
            storage,
            notifier,
            entries: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// The stored entry for a key, loading it from disk on first access
    pub async fn get(&self, collection: &str, identity: &str) -> SyncResult<Option<CacheEntry>> {
        let key = (identity.to_string(), collection.to_string());
        if let Some(loaded) = self.entries.read().get(&key) {
            return Ok(loaded.clone());
        }

        let entry = match self
            .storage
            .get(NAMESPACE, &entry_key(identity, collection))
            .await?
        {
            Some(blob) => Some(codec::decode::<CacheEntry>(&blob)?),
            None => None,
        };

        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| entry.clone());
        Ok(entry)
    }

    /// Replace the whole entry for its (collection, identity)
    pub async fn put(&self, entry: CacheEntry) -> SyncResult<()> {
        let _writer = self.write_lock.lock().await;
        self.persist(entry).await
    }

    /// Read-modify-write one entry, creating it if absent
    pub async fn update<R>(
        &self,
        collection: &str,
        identity: &str,
        mutation: impl FnOnce(&mut CacheEntry) -> R,
    ) -> SyncResult<R> {
        let _writer = self.write_lock.lock().await;

        let mut entry = self
            .get(collection, identity)
            .await?
            .unwrap_or_else(|| CacheEntry::new(collection, identity));
        let result = mutation(&mut entry);

        self.persist(entry).await?;
        Ok(result)
    }

    async fn persist(&self, entry: CacheEntry) -> SyncResult<()> {
        let identity = entry.owner_identity.clone();
        let collection = entry.collection.clone();

        let is_new = self.get(&collection, &identity).await?.is_none();
        if is_new {
            self.add_to_index(&identity, &collection).await?;
        }

        let blob = codec::encode(&entry)?;
        self.storage
            .set(NAMESPACE, &entry_key(&identity, &collection), &blob)
            .await?;

        self.entries
            .write()
            .insert((identity.clone(), collection.clone()), Some(entry));
        self.notifier.notify(ChangeEvent::CacheChanged {
            collection,
            identity,
        });
        Ok(())
    }

    async fn load_index(&self, identity: &str) -> SyncResult<Vec<String>> {
        match self.storage.get(NAMESPACE, &index_key(identity)).await? {
            Some(blob) => codec::decode(&blob),
            None => Ok(Vec::new()),
        }
    }

    async fn add_to_index(&self, identity: &str, collection: &str) -> SyncResult<()> {
        let mut index = self.load_index(identity).await?;
        if !index.iter().any(|c| c == collection) {
            index.push(collection.to_string());
            let blob = codec::encode(&index)?;
            self.storage
                .set(NAMESPACE, &index_key(identity), &blob)
                .await?;
        }
        Ok(())
    }

    /// Collections that have a stored entry for `identity`
    pub async fn collections_for(&self, identity: &str) -> SyncResult<Vec<String>> {
        self.load_index(identity).await
    }

    /// Drop one entry
    pub async fn remove(&self, collection: &str, identity: &str) -> SyncResult<()> {
        let _writer = self.write_lock.lock().await;
        self.storage
            .delete(NAMESPACE, &entry_key(identity, collection))
            .await?;
        self.entries
            .write()
            .insert((identity.to_string(), collection.to_string()), None);

        debug!("Removed cache entry {}/{}", identity, collection);
        self.notifier.notify(ChangeEvent::CacheChanged {
            collection: collection.to_string(),
            identity: identity.to_string(),
        });
        Ok(())
    }

    /// Drop every entry belonging to `identity`. Returns how many were dropped.
    pub async fn invalidate_identity(&self, identity: &str) -> SyncResult<usize> {
        let _writer = self.write_lock.lock().await;

        let collections = self.load_index(identity).await?;
        for collection in &collections {
            self.storage
                .delete(NAMESPACE, &entry_key(identity, collection))
                .await?;
        }
        self.storage.delete(NAMESPACE, &index_key(identity)).await?;

        self.entries.write().retain(|(who, _), _| who != identity);

        info!(
            "Invalidated {} cached collections for {}",
            collections.len(),
            identity
        );
        self.notifier.notify(ChangeEvent::CacheInvalidated {
            identity: identity.to_string(),
        });
        Ok(collections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn store_with(storage: Arc<MemoryStore>) -> CacheStore {
        CacheStore::new(storage, ChangeNotifier::default())
    }

    #[tokio::test]
    async fn test_absent_until_written() {
        let store = store_with(Arc::new(MemoryStore::new()));
        assert!(store.get("habits", "u1").await.unwrap().is_none());

        store
            .update("habits", "u1", |entry| {
                entry
                    .records
                    .push(json!({"id": "h1"}).as_object().cloned().unwrap());
            })
            .await
            .unwrap();

        let entry = store.get("habits", "u1").await.unwrap().unwrap();
        assert_eq!(entry.len(), 1);
        assert!(entry.fetched_at.is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reload() {
        let storage = Arc::new(MemoryStore::new());
        {
            let store = store_with(storage.clone());
            let mut entry = CacheEntry::new("habits", "u1");
            entry.fetched_at = Some(chrono::Utc::now());
            store.put(entry).await.unwrap();
        }

        let store = store_with(storage);
        let entry = store.get("habits", "u1").await.unwrap().unwrap();
        assert!(entry.fetched_at.is_some());
        assert_eq!(store.collections_for("u1").await.unwrap(), vec!["habits"]);
    }

    #[tokio::test]
    async fn test_invalidate_identity_only_drops_that_identity() {
        let storage = Arc::new(MemoryStore::new());
        let store = store_with(storage.clone());
        store.put(CacheEntry::new("habits", "u1")).await.unwrap();
        store.put(CacheEntry::new("medications", "u1")).await.unwrap();
        store.put(CacheEntry::new("habits", "u2")).await.unwrap();

        let dropped = store.invalidate_identity("u1").await.unwrap();
        assert_eq!(dropped, 2);

        assert!(store.get("habits", "u1").await.unwrap().is_none());
        assert!(store.get("medications", "u1").await.unwrap().is_none());
        assert!(store.get("habits", "u2").await.unwrap().is_some());

        // Disk agrees with memory
        let reloaded = store_with(storage);
        assert!(reloaded.get("habits", "u1").await.unwrap().is_none());
        assert!(reloaded.get("habits", "u2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_single_entry() {
        let store = store_with(Arc::new(MemoryStore::new()));
        store.put(CacheEntry::new("habits", "u1")).await.unwrap();
        store.remove("habits", "u1").await.unwrap();
        assert!(store.get("habits", "u1").await.unwrap().is_none());
    }
}
