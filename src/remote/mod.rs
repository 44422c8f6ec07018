//! Remote store collaborator
//!
//! The authoritative store the queue drains into. The engine only needs
//! per-(collection, identity) create/update/delete plus a way to read the
//! full record set, either once or as a live stream of snapshots.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::record::{Payload, Record};

pub use http::HttpRemote;
pub use memory::{InMemoryRemote, RemoteCall};

/// Remote failures, split by whether retrying can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Retrying the same request will not succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RemoteError::PermissionDenied(_) | RemoteError::NotFound(_) | RemoteError::Rejected(_)
        )
    }

    /// The device probably lost connectivity
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Live snapshots of one collection
pub type SnapshotStream = BoxStream<'static, RemoteResult<Vec<Record>>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record. `client_id` is the id the device used locally; the
    /// remote may keep it or assign its own. Returns the id it stored under.
    async fn create_record(
        &self,
        collection: &str,
        identity: &str,
        client_id: &str,
        data: &Payload,
    ) -> RemoteResult<String>;

    /// Merge `partial` into an existing record
    async fn update_record(
        &self,
        collection: &str,
        identity: &str,
        id: &str,
        partial: &Payload,
    ) -> RemoteResult<()>;

    async fn delete_record(&self, collection: &str, identity: &str, id: &str) -> RemoteResult<()>;

    /// Full current record set
    async fn fetch_all(&self, collection: &str, identity: &str) -> RemoteResult<Vec<Record>>;

    /// Live snapshots, if the remote can push them
    fn watch(&self, _collection: &str, _identity: &str) -> Option<SnapshotStream> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RemoteError::PermissionDenied("x".into()).is_permanent());
        assert!(RemoteError::NotFound("x".into()).is_permanent());
        assert!(RemoteError::Rejected("x".into()).is_permanent());
        assert!(!RemoteError::Timeout.is_permanent());
        assert!(!RemoteError::Network("reset".into()).is_permanent());

        assert!(RemoteError::Timeout.is_connectivity());
        assert!(!RemoteError::Rejected("x".into()).is_connectivity());
    }
}
