use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scout_core::RunRecord;
use scout_db::{EntityStore, MemoryStore, PgStore, StoreSession};
use scout_sync::{build_pipeline, maybe_build_scheduler, ScoutConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Sponsor register reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass now.
    Run {
        /// Reconcile into a throwaway in-memory store.
        #[arg(long)]
        memory: bool,
    },
    /// Run reconciliations on the configured cron schedule until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Show the in-progress and most recently completed runs.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let config = ScoutConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { memory: false }) {
        Commands::Run { memory } => {
            let store: Arc<dyn EntityStore> = if memory {
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(PgStore::connect(&config.database_url).await?)
            };
            let pipeline = build_pipeline(&config, store)?;
            let run = pipeline.run_once().await?;
            print_run(&run);
        }
        Commands::Schedule => {
            let store: Arc<dyn EntityStore> =
                Arc::new(PgStore::connect(&config.database_url).await?);
            let pipeline = Arc::new(build_pipeline(&config, store)?);
            match maybe_build_scheduler(&config, pipeline).await? {
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    println!("scheduler running with cron {:?}", config.sync_cron);
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for shutdown signal")?;
                    sched.shutdown().await.context("stopping scheduler")?;
                }
                None => println!("scheduler disabled; set SCOUT_SCHEDULER_ENABLED=1"),
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Status => {
            let store = PgStore::connect(&config.database_url).await?;
            let session = store.open_session().await?;
            match session.find_in_progress_run().await? {
                Some(run) => print_run(&run),
                None => println!("no run in progress"),
            }
            match session.latest_completed_run().await? {
                Some(run) => print_run(&run),
                None => println!("no completed runs yet"),
            }
        }
    }

    Ok(())
}

fn print_run(run: &RunRecord) {
    println!(
        "run {} [{}] started={} finished={} file={} total={} added={} updated={} deleted={} errors={}",
        run.id,
        run.status,
        run.started_at.to_rfc3339(),
        run.finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        run.file_name.as_deref().unwrap_or("-"),
        run.total_records_processed,
        run.added.count,
        run.updated.count,
        run.deleted.count,
        run.errors.len(),
    );
    for error in &run.errors {
        println!("  error [{}] {}", error.origin, error.message);
    }
}
