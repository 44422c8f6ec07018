pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod notify;
pub mod queue;
pub mod record;
pub mod remote;
pub mod storage;
pub mod sync;

pub use cache::CacheEntry;
pub use config::EngineConfig;
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivitySource, ManualConnectivity,
    ProbeConnectivity, ReachabilityProbe,
};
pub use engine::{EngineBuilder, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::{IdentityHandle, IdentityResolver};
pub use models::{Collection, Model};
pub use notify::{ChangeEvent, ChangeNotifier, Subscription};
pub use queue::{ItemStatus, OperationType, QueueConfig, QueueItem};
pub use record::{Payload, Record};
pub use remote::{HttpRemote, InMemoryRemote, RemoteError, RemoteStore};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use sync::{DrainOutcome, DrainReport, ProcessorState, SyncCommand, SyncHandle, SyncStats};
