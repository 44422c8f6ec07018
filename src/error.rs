use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported storage format version {found} (supported up to {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    #[error("Identity mismatch: expected '{expected}', got '{found}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("No active identity")]
    NoIdentity,

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Queue item '{0}' not found")]
    ItemNotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// True when the failure came from the local persistent store.
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Io(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
