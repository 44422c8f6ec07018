//! Durable cache store and merger
//!
//! Per-(collection, identity) snapshots of the last known records, merged
//! with still-queued local writes before anyone reads them.

pub mod entry;
pub mod merge;
pub mod store;

pub use entry::CacheEntry;
pub use merge::{apply_item, merge_snapshot, overlay_pending, rekey};
pub use store::CacheStore;
