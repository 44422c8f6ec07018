use std::path::PathBuf;
use std::sync::Arc;

use caresync::connectivity::ReachabilityProbe;
use caresync::{
    DrainOutcome, EngineConfig, HttpRemote, IdentityHandle, InMemoryRemote, KeyValueStore,
    ManualConnectivity, OperationType, Payload, RemoteStore, SqliteStore, SyncEngine,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_FILE_NAME: &str = "caresync.db";
const ENV_IDENTITY: &str = "CARESYNC_IDENTITY";

#[derive(Parser, Debug)]
#[command(name = "caresync")]
#[command(about = "Inspect and drive the local-first sync queue", long_about = None)]
struct Cli {
    /// Directory containing caresync.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Directory for the local database (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Identity to act as (falls back to CARESYNC_IDENTITY)
    #[arg(short, long)]
    identity: Option<String>,

    /// Use an in-process remote instead of the configured server
    #[arg(long)]
    simulate: bool,

    /// Treat the device as offline
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show pending/failed counts and connectivity
    Status,
    /// List queued operations for the identity
    Pending,
    /// Queue an operation
    Enqueue {
        collection: String,
        /// create, update or delete
        operation: OperationType,
        /// Target record id; a temporary id is minted for creates when omitted
        #[arg(long)]
        id: Option<String>,
        /// JSON object payload
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Print the cached view of a collection
    Cache {
        collection: String,
        /// Fetch from the remote first
        #[arg(long)]
        refresh: bool,
    },
    /// Drain the queue and refresh cached collections
    Sync,
    /// Reset failed operations and drain again
    RetryFailed,
    /// Drop every queued operation
    Clear {
        /// Confirm dropping unsynced writes
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "caresync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = EngineConfig::load(&cli.config_dir)?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = Some(dir);
    }
    // One-shot commands drive the engine directly
    config.auto_sync = false;

    let storage: Arc<dyn KeyValueStore> = Arc::new(match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            SqliteStore::open(dir.join(DB_FILE_NAME))?
        }
        None => SqliteStore::open_default("caresync")?,
    });

    let identity = cli
        .identity
        .clone()
        .or_else(|| std::env::var(ENV_IDENTITY).ok().filter(|s| !s.is_empty()));
    let identity_handle = Arc::new(IdentityHandle::new(identity.clone()));

    let (remote, online): (Arc<dyn RemoteStore>, bool) = if cli.simulate {
        (Arc::new(InMemoryRemote::with_server_ids()), !cli.offline)
    } else {
        let mut http = HttpRemote::new(
            &config.remote.url,
            &config.remote.database,
            config.item_timeout(),
        )?;
        if !config.remote.token.is_empty() {
            http = http.with_token(&config.remote.token);
        }
        let online = !cli.offline && http.probe().await;
        if !online {
            tracing::warn!("Remote {} unreachable, working offline", config.remote.url);
        }
        (Arc::new(http), online)
    };

    let engine = SyncEngine::builder()
        .config(config)
        .storage(storage)
        .remote(remote)
        .identity(identity_handle)
        .connectivity(Arc::new(ManualConnectivity::new(online)))
        .build()
        .await?;

    let require_identity = || {
        identity.clone().ok_or_else(|| {
            anyhow::anyhow!("no identity given; pass --identity or set {}", ENV_IDENTITY)
        })
    };

    match cli.command {
        Command::Status => {
            let stats = engine.get_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Pending => {
            require_identity()?;
            let items = engine.list_pending();
            if items.is_empty() {
                println!("Queue is empty");
            }
            for item in items {
                println!(
                    "{}  {:<6} {}/{}  retries={} status={:?}{}",
                    item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    item.operation,
                    item.collection,
                    item.document_id,
                    item.retry_count,
                    item.status,
                    item.last_error
                        .as_ref()
                        .map(|e| format!("  last_error={}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Enqueue {
            collection,
            operation,
            id,
            data,
        } => {
            let owner = require_identity()?;
            let payload: Payload = serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("--data must be a JSON object: {}", e))?;

            let document_id = match (operation, id) {
                (OperationType::Create, None) => engine.create(&collection, payload).await?,
                (OperationType::Create, Some(id)) => {
                    engine
                        .enqueue(operation, &collection, &id, &owner, payload.clone())
                        .await?;
                    engine
                        .add_to_cache_item(
                            &collection,
                            &owner,
                            caresync::record::new_record(&id, &payload),
                        )
                        .await?;
                    id
                }
                (OperationType::Update, Some(id)) => {
                    engine.update(&collection, &id, payload).await?;
                    id
                }
                (OperationType::Delete, Some(id)) => {
                    engine.delete(&collection, &id).await?;
                    id
                }
                (_, None) => anyhow::bail!("--id is required for {}", operation),
            };
            println!(
                "Queued {} {}/{} ({} pending)",
                operation,
                collection,
                document_id,
                engine.get_pending_count()
            );
        }
        Command::Cache {
            collection,
            refresh,
        } => {
            let owner = require_identity()?;
            if refresh {
                let count = engine.refresh_collection(&collection).await?;
                tracing::info!("Fetched {} records", count);
            }
            match engine.get_from_cache(&collection, &owner).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry.records)?),
                None => println!("Nothing cached for {}", collection),
            }
        }
        Command::Sync => {
            require_identity()?;
            print_outcome(&engine.sync_now().await);
        }
        Command::RetryFailed => {
            require_identity()?;
            let reset = engine.retry_failed().await?;
            println!("Reset {} failed operations", reset);
            print_outcome(&engine.process_queue().await);
        }
        Command::Clear { yes } => {
            if !yes {
                anyhow::bail!(
                    "refusing to drop {} queued operations without --yes",
                    engine.get_pending_count()
                );
            }
            let dropped = engine.clear_queue().await?;
            println!("Dropped {} queued operations", dropped);
        }
    }

    Ok(())
}

fn print_outcome(outcome: &DrainOutcome) {
    match outcome {
        DrainOutcome::Offline => println!("Offline, nothing sent"),
        DrainOutcome::Coalesced => println!("A sync is already running"),
        DrainOutcome::Completed(report) | DrainOutcome::Interrupted(report) => {
            let label = if matches!(outcome, DrainOutcome::Interrupted(_)) {
                "Interrupted"
            } else {
                "Done"
            };
            println!(
                "{}: {} synced, {} failed, {} permanently failed, {} blocked, {} not attempted, {} refreshed",
                label,
                report.succeeded,
                report.failed,
                report.permanently_failed,
                report.blocked,
                report.remaining,
                report.refreshed
            );
            for error in &report.errors {
                println!("  error: {}", error);
            }
        }
    }
}
