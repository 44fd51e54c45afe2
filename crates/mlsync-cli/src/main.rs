use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use mlsync_adapters::{bulk_bundle_to_records, load_bulk_import_bundle};
use mlsync_sync::{run_scheduler_until_shutdown, CycleOutcome, SyncConfig, SyncOrchestrator};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mlsync")]
#[command(about = "MLS building listing sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle (initial or incremental, depending on stored state).
    Sync,
    /// Load a manual bulk-import bundle into the cache.
    Import { bundle: PathBuf },
    /// Print the stored sync state.
    Status,
    /// Clear the sync state; with --cache also drop every partition.
    Reset {
        #[arg(long)]
        cache: bool,
    },
    /// Write the deduplicated cache and snapshot history as parquet.
    Export { dir: PathBuf },
    Serve,
    /// Run cycles on MLSYNC_SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let orchestrator = SyncOrchestrator::from_config(&config).await?;
            match orchestrator.run_once().await? {
                CycleOutcome::Completed(summary) => println!(
                    "sync complete: run_id={} mode={:?} fetched={} matched={} unmatched={} watermark={}",
                    summary.run_id,
                    summary.mode,
                    summary.fetched,
                    summary.assignment.matched,
                    summary.assignment.unmatched,
                    summary.watermark
                ),
                CycleOutcome::AlreadyRunning { since, .. } => {
                    println!("sync skipped: another run has been in progress since {since}")
                }
            }
        }
        Commands::Import { bundle } => {
            let bundle = load_bulk_import_bundle(&bundle)?;
            let records = bulk_bundle_to_records(&bundle, Utc::now())?;
            info!(import_id = %bundle.import_id, records = records.len(), "importing bundle");
            let orchestrator = SyncOrchestrator::from_config(&config).await?;
            match orchestrator.import_bulk(records).await? {
                CycleOutcome::Completed(summary) => println!(
                    "import complete: import_id={} records={} unmatched={} reconciled={}",
                    bundle.import_id,
                    summary.records,
                    summary.assignment.unmatched,
                    summary.assignment.reconciled
                ),
                CycleOutcome::AlreadyRunning { since, .. } => {
                    println!("import refused: a sync has been in progress since {since}")
                }
            }
        }
        Commands::Status => {
            let orchestrator = SyncOrchestrator::from_config(&config).await?;
            let state = orchestrator.get_sync_status().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Reset { cache } => {
            let orchestrator = SyncOrchestrator::from_config(&config).await?;
            let cleared = orchestrator.reset_sync_state().await?;
            println!("sync state cleared: {cleared}");
            if cache {
                let removed = orchestrator.reset_cache().await?;
                println!("partitions removed: {removed}");
            }
        }
        Commands::Export { dir } => {
            let orchestrator = SyncOrchestrator::from_config(&config).await?;
            let (manifest_path, manifest) = orchestrator.export(&dir).await?;
            println!(
                "export complete: files={} manifest={}",
                manifest.files.len(),
                manifest_path.display()
            );
        }
        Commands::Serve => {
            mlsync_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(SyncOrchestrator::from_config(&config).await?);
            run_scheduler_until_shutdown(orchestrator, &config).await?;
        }
    }

    Ok(())
}
