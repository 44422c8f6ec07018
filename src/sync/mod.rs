//! Queue draining and background sync
//!
//! - `processor`: one drain pass over the durable queue (Idle / Draining / Backoff)
//! - `worker`: background task deciding when to drain
//! - `stats`: health snapshot exposed to the UI

pub mod processor;
pub mod stats;
pub mod worker;

pub use processor::{DrainOutcome, DrainReport, ProcessorState, SyncProcessor};
pub use stats::SyncStats;
pub use worker::{create_command_channel, Backoff, SyncCommand, SyncHandle, SyncWorker};
