//! Durable operation queue
//!
//! Pending create/update/delete operations, kept in enqueue order and
//! persisted before anyone is told they exist.

pub mod store;
pub mod types;

pub use store::{FailureOutcome, QueueCounts, QueueStore};
pub use types::{ItemStatus, OperationType, QueueConfig, QueueItem};
