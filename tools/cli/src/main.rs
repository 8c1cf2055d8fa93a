//! Keel CLI - command line interface for the offline-first sync core.
//!
//! This tool operates a local store against the in-memory reference backend:
//! inspect mirrored collections, queue writes, trigger reconciliation passes,
//! and resolve conflicts. Real deployments swap the backend for a transport
//! implementing the same trait.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use keel_common::{Collection, Payload, RecordId, Resolution};
use keel_remote::{Filter, MemoryBackend};
use keel_store::LocalStore;
use keel_sync::{Connectivity, ConflictResolver, DataAccess, ReconcilerConfig, Reconciler};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Keel - offline-first data synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Store database path (default: platform data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record from a JSON field map.
    Put {
        /// Collection name.
        collection: String,

        /// Record fields as a JSON object.
        json: String,

        /// Payload schema version.
        #[arg(long, default_value_t = 1)]
        schema: u32,

        /// Tenant/base partition key.
        #[arg(long)]
        scope: Option<String>,
    },

    /// Show one record from the local mirror.
    Get {
        collection: String,
        id: String,
    },

    /// List a collection.
    List {
        collection: String,

        /// Restrict to one partition.
        #[arg(long)]
        scope: Option<String>,
    },

    /// Delete a record.
    Rm {
        collection: String,
        id: String,
    },

    /// Merge a partial JSON object into a record.
    Patch {
        collection: String,
        id: String,
        json: String,

        /// Payload schema version.
        #[arg(long, default_value_t = 1)]
        schema: u32,
    },

    /// Run one reconciliation pass.
    Sync,

    /// Show per-collection sync bookkeeping and queue depth.
    Status,

    /// List unresolved conflicts.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        /// Conflict id (from `keel conflicts`).
        conflict_id: i64,

        /// Strategy: local-wins, remote-wins, or manual-merge.
        strategy: String,

        /// Merged fields as a JSON object (manual-merge only).
        #[arg(long)]
        json: Option<String>,

        /// Payload schema version for the merged fields.
        #[arg(long, default_value_t = 1)]
        schema: u32,
    },

    /// Toggle the persisted offline override.
    Offline {
        /// "on" or "off".
        state: String,
    },

    /// Prune old resolved conflicts and quarantined changes.
    Vacuum {
        /// Retention window in days.
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

fn parse_payload(json: &str, schema: u32) -> Result<Payload> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("Payload is not valid JSON")?;
    let fields = value
        .as_object()
        .cloned()
        .ok_or_else(|| anyhow!("Payload must be a JSON object"))?;
    Ok(Payload::new(schema, fields))
}

fn store_path(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    let base = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("keel"),
    };
    std::fs::create_dir_all(&base)
        .with_context(|| format!("Failed to create data directory {base:?}"))?;
    Ok(base.join("keel.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to initialize logging")?;

    let store = Arc::new(
        LocalStore::open(store_path(cli.data_dir)?).context("Failed to open local store")?,
    );
    let backend = Arc::new(MemoryBackend::new());
    let connectivity = Arc::new(Connectivity::new(store.clone())?);
    let access = DataAccess::new(store.clone(), backend.clone(), connectivity.clone());

    match cli.command {
        Commands::Put {
            collection,
            json,
            schema,
            scope,
        } => {
            let collection = Collection::new(collection)?;
            let payload = parse_payload(&json, schema)?;
            let id = access.create(&collection, payload, scope.as_deref()).await?;
            println!("{id}");
        }

        Commands::Get { collection, id } => {
            let collection = Collection::new(collection)?;
            let id = RecordId::new(id)?;
            match access.get(&collection, &id)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                None => return Err(anyhow!("Record not found: {collection}/{id}")),
            }
        }

        Commands::List { collection, scope } => {
            let collection = Collection::new(collection)?;
            let filter = match scope {
                Some(scope) => Filter::scoped(scope),
                None => Filter::all(),
            };
            let result = access.read(&collection, &filter).await?;
            println!(
                "# {} rows ({:?})",
                result.records.len(),
                result.freshness
            );
            for record in result.records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }

        Commands::Rm { collection, id } => {
            let collection = Collection::new(collection)?;
            let id = RecordId::new(id)?;
            access.delete(&collection, &id).await?;
            println!("Deleted {collection}/{id}");
        }

        Commands::Patch {
            collection,
            id,
            json,
            schema,
        } => {
            let collection = Collection::new(collection)?;
            let id = RecordId::new(id)?;
            let partial = parse_payload(&json, schema)?;
            access.update(&collection, &id, &partial).await?;
            println!("Updated {collection}/{id}");
        }

        Commands::Sync => {
            let engine = Reconciler::new(store.clone(), backend, ReconcilerConfig::default());
            match engine.run_pass().await? {
                Some(summary) => println!(
                    "Applied {}, conflicts {}, deferred {}, quarantined {}, pulled {} in {:?}",
                    summary.applied,
                    summary.conflicts,
                    summary.deferred,
                    summary.quarantined,
                    summary.pulled,
                    summary.duration
                ),
                None => println!("A pass is already running"),
            }
        }

        Commands::Status => {
            println!(
                "Effective online: {} (network {}, offline override {})",
                connectivity.effective_online(),
                connectivity.network_reachable(),
                connectivity.force_offline()
            );
            for collection in store.known_collections()? {
                let metadata = store.metadata(&collection)?;
                let quarantined = store.quarantined_changes(&collection)?.len();
                println!(
                    "{}: {} pending, {} quarantined, last sync {}",
                    collection,
                    store.pending_count(&collection)?,
                    quarantined,
                    metadata
                        .last_sync_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }

        Commands::Conflicts => {
            let resolver = ConflictResolver::new(store);
            let open = resolver.open()?;
            if open.is_empty() {
                println!("No unresolved conflicts");
            }
            for conflict in open {
                println!(
                    "#{} {}/{} {} (detected {})",
                    conflict.id,
                    conflict.collection,
                    conflict.record_id,
                    conflict.kind.as_str(),
                    conflict.detected_at.to_rfc3339()
                );
            }
        }

        Commands::Resolve {
            conflict_id,
            strategy,
            json,
            schema,
        } => {
            let strategy = Resolution::parse(&strategy)?;
            let merged = json.map(|j| parse_payload(&j, schema)).transpose()?;
            let resolver = ConflictResolver::new(store);
            resolver.resolve(conflict_id, strategy, merged)?;
            println!("Resolved conflict #{conflict_id} as {}", strategy.as_str());
        }

        Commands::Offline { state } => {
            let force_offline = match state.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(anyhow!("Expected 'on' or 'off', got '{other}'")),
            };
            connectivity.set_force_offline(force_offline)?;
            println!(
                "Offline override {}",
                if force_offline { "enabled" } else { "disabled" }
            );
        }

        Commands::Vacuum { days } => {
            let pruned = store.vacuum(chrono::Duration::days(days))?;
            println!("Pruned {pruned} rows");
        }
    }

    Ok(())
}
