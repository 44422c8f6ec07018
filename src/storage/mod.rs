//! Persistent local storage
//!
//! The engine serializes its queue and cache into a namespaced key/string
//! blob store. Anything that can get/set/delete strings can back it.

pub mod codec;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::SyncResult;

pub use codec::{decode, encode, FORMAT_VERSION};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Namespaced key -> string blob store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> SyncResult<Option<String>>;

    async fn set(&self, namespace: &str, key: &str, value: &str) -> SyncResult<()>;

    async fn delete(&self, namespace: &str, key: &str) -> SyncResult<()>;
}
