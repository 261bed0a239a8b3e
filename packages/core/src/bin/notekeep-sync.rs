//! Sync Cycle Binary
//!
//! Opens the note database, loads the repository and runs one sync cycle
//! against the simulated remote, then prints the report as JSON.
//!
//! With `sync.interval_secs` set in the config file, it instead starts the
//! background sync worker and keeps syncing on that period until Ctrl-C,
//! printing the last report on exit.
//!
//! # Usage
//!
//! ```bash
//! # Default config (./notekeep.db, 10% synthetic failure rate)
//! cargo run --bin notekeep-sync
//!
//! # Config file and overrides
//! NOTEKEEP_SYNC_FAILURE_RATE=0 cargo run --bin notekeep-sync -- notekeep.json
//! ```
//!
//! # Environment Variables
//!
//! - `NOTEKEEP_DB_PATH`: Database file
//! - `NOTEKEEP_SYNC_FAILURE_RATE`: Synthetic push failure rate in [0, 1]
//! - `NOTEKEEP_OPEN_RETRIES`: Store open retries
//! - `RUST_LOG`: Logging level (e.g., "info", "debug", "trace")

use std::path::PathBuf;
use std::sync::Arc;

use notekeep_core::logging::init_tracing;
use notekeep_core::services::{LoadOutcome, NoteRepository, SimulatedRemote, SyncQueue};
use notekeep_core::{EngineConfig, EntityStore, LibsqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("notekeep.json"));
    let config = EngineConfig::load(&config_path)?.apply_env_overrides();

    tracing::info!("Database: {}", config.store.database_path.display());

    let store: Arc<dyn EntityStore> = Arc::new(LibsqlStore::open_with_retry(&config.store).await?);
    let repository = Arc::new(NoteRepository::new(Arc::clone(&store)));

    if let LoadOutcome::Loaded {
        notes,
        folders,
        skipped,
    } = repository.load().await?
    {
        tracing::info!(
            "Repository ready: {} notes, {} folders, {} skipped",
            notes,
            folders,
            skipped
        );
    }

    let queue = Arc::new(
        SyncQueue::new(
            Arc::clone(&store),
            Arc::new(SimulatedRemote::new(&config.sync)),
            &config.store,
        )
        .with_observer(repository.clone()),
    );

    let report = match config.sync.interval() {
        Some(period) => {
            tracing::info!("Syncing every {:?}, press Ctrl-C to stop", period);
            let worker = Arc::clone(&queue).spawn(Some(period));
            worker.trigger().request();
            tokio::signal::ctrl_c().await?;
            worker.shutdown().await;
            queue.last_report().await.unwrap_or_default()
        }
        None => queue.run_cycle().await,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let stats = repository.stats().await;
    tracing::info!("{} of {} notes still unsynced", stats.unsynced, stats.notes);

    store.close().await?;

    if report.is_total_failure() {
        anyhow::bail!("sync cycle failed");
    }
    Ok(())
}
