//! Engine configuration
//!
//! Read from `caresync.toml`. Any `.env` file next to it is loaded first,
//! then these environment variables override the file:
//!
//! - `CARESYNC_REMOTE_URL` - Base URL of the remote document API
//! - `CARESYNC_DATABASE` - Remote database name
//! - `CARESYNC_TOKEN` - Bearer token for the remote
//! - `CARESYNC_DATA_DIR` - Directory holding the local SQLite file
//! - `CARESYNC_ITEM_TIMEOUT_MS` - Per-item remote call timeout
//! - `CARESYNC_MAX_RETRIES` - Attempts before an item is permanently failed
//! - `CARESYNC_AUTO_SYNC` - `true` / `false`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::queue::QueueConfig;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "caresync.toml";

pub const ENV_REMOTE_URL: &str = "CARESYNC_REMOTE_URL";
pub const ENV_DATABASE: &str = "CARESYNC_DATABASE";
pub const ENV_TOKEN: &str = "CARESYNC_TOKEN";
pub const ENV_DATA_DIR: &str = "CARESYNC_DATA_DIR";
pub const ENV_ITEM_TIMEOUT_MS: &str = "CARESYNC_ITEM_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "CARESYNC_MAX_RETRIES";
pub const ENV_AUTO_SYNC: &str = "CARESYNC_AUTO_SYNC";

/// Sync engine tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Bound on a single remote call during a drain
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,
    /// Transient failures before an item becomes permanently failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry count above which an item is reported as failed in stats
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long connectivity must stay up before it counts as online
    #[serde(default = "default_connectivity_debounce_ms")]
    pub connectivity_debounce_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Periodic drain interval while items are pending
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Drain automatically on online edges, intervals and new writes
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Re-fetch collections touched by a drain
    #[serde(default = "default_true")]
    pub refresh_after_sync: bool,
    /// Also push items queued by identities other than the current one
    #[serde(default)]
    pub flush_other_identities: bool,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Where the local database lives; platform data dir when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Remote document API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_url")]
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub token: String,
}

fn default_item_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_connectivity_debounce_ms() -> u64 {
    1_500
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_remote_url() -> String {
    "http://localhost:6745".to_string()
}

fn default_database() -> String {
    "_system".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            database: default_database(),
            token: String::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_timeout_ms: default_item_timeout_ms(),
            max_retries: default_max_retries(),
            failure_threshold: default_failure_threshold(),
            connectivity_debounce_ms: default_connectivity_debounce_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            auto_sync: true,
            refresh_after_sync: true,
            flush_other_identities: false,
            queue: QueueConfig::default(),
            remote: RemoteConfig::default(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load `caresync.toml` from `dir`. A missing file yields the defaults;
    /// environment overrides apply either way.
    pub fn load(dir: &Path) -> SyncResult<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply environment variable overrides to the configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_REMOTE_URL) {
            if !url.is_empty() {
                self.remote.url = url;
            }
        }

        if let Ok(database) = std::env::var(ENV_DATABASE) {
            if !database.is_empty() {
                self.remote.database = database;
            }
        }

        if let Ok(token) = std::env::var(ENV_TOKEN) {
            if !token.is_empty() {
                self.remote.token = token;
            }
        }

        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(ms) = std::env::var(ENV_ITEM_TIMEOUT_MS) {
            if let Ok(ms) = ms.parse::<u64>() {
                self.item_timeout_ms = ms;
            }
        }

        if let Ok(retries) = std::env::var(ENV_MAX_RETRIES) {
            if let Ok(retries) = retries.parse::<u32>() {
                self.max_retries = retries;
            }
        }

        if let Ok(auto) = std::env::var(ENV_AUTO_SYNC) {
            if let Ok(auto) = auto.parse::<bool>() {
                self.auto_sync = auto;
            }
        }
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_millis(self.connectivity_debounce_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}
