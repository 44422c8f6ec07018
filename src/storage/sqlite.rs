//! SQLite-backed blob store
//!
//! One `kv` table keyed by (namespace, key). Every `set` is a single
//! upsert statement, so a blob is either fully replaced or untouched.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::KeyValueStore;
use crate::error::{SyncError, SyncResult};

/// Local storage backend using SQLite
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    /// Open a store in the default location (user data directory)
    pub fn open_default(app_name: &str) -> SyncResult<Self> {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
            })
            .join(app_name);

        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join("caresync.db"))
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
             );",
        )
        .map_err(|e| SyncError::Storage(format!("failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> SyncResult<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (namespace, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
            params![namespace, key, value, now],
        )?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> SyncResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_blob_storage() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.set("queue", "items", "[1]").await.unwrap();
        assert_eq!(
            store.get("queue", "items").await.unwrap().as_deref(),
            Some("[1]")
        );

        store.set("queue", "items", "[1,2]").await.unwrap();
        assert_eq!(
            store.get("queue", "items").await.unwrap().as_deref(),
            Some("[1,2]")
        );

        store.delete("queue", "items").await.unwrap();
        assert!(store.get("queue", "items").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("cache", "u1/appointments", "blob").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("cache", "u1/appointments").await.unwrap().as_deref(),
            Some("blob")
        );
        assert!(store.get("queue", "u1/appointments").await.unwrap().is_none());
    }
}
