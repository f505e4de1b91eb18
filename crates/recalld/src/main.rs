//! Recall daemon
//!
//! Connects to the backing store, then runs periodic sync, consolidation
//! and reconciliation until Ctrl-C. On shutdown pending writes are flushed
//! once more and anything still unpersisted is reported.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use recall_core::coordination::CoordinationStateManager;
use recall_core::memory::TieredMemoryStore;
use recall_core::{connect_remote, spawn_worker, telemetry, RecallConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "recalld")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Recall background daemon", long_about = None)]
struct Args {
    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, env = "RECALL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    // The daemon logs at info by default.
    telemetry::init_tracing(args.json, telemetry::level_for_verbosity(args.verbose.saturating_add(1)));

    let config = RecallConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    // Retries the connection on each probe if the store is down now.
    let remote = connect_remote(&config.remote).await;
    let memory =
        Arc::new(TieredMemoryStore::open(remote.clone(), config.memory_store_config()).await);
    let coordination =
        Arc::new(CoordinationStateManager::open(remote.clone(), config.coordination_config()).await);

    let worker = spawn_worker(memory.clone(), coordination.clone(), config.worker_schedule());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        connected = remote.is_connected(),
        "recalld started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, flushing");

    let summary = worker.shutdown().await;
    if summary.final_sync.failed_count + summary.final_reconcile.failed > 0 {
        warn!(
            memories = summary.final_sync.failed_count,
            coordination = summary.final_reconcile.failed,
            "Exiting with unpersisted state"
        );
    }
    info!(
        sync_passes = summary.sync_passes,
        consolidation_passes = summary.consolidation_passes,
        reconcile_passes = summary.reconcile_passes,
        "recalld stopped"
    );
    Ok(())
}
