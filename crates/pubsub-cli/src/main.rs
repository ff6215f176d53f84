//! `pubsub-cli` — operator commands for the pg-pubsub engine. No business
//! logic of its own: every subcommand is a thin clap wrapper around the
//! `pubsub-*` library crates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pubsub_discovery::{discover, OrmMetadataProvider, TableDescriptor};
use pubsub_lock::AdvisoryLockService;
use pubsub_queue::QueueService;
use pubsub_trigger::TriggerService;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "pubsub")]
#[command(about = "pg-pubsub engine operator CLI", long_about = None)]
struct Cli {
    /// Optional layered config file; falls back to env-only (§6.2).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Force an immediate trigger reconciliation pass (§4.4).
    ReconcileNow,

    /// Print per-status row counts for the queue table (§3.3).
    QueueStats,

    /// Force an immediate TTL cleanup pass (§4.3).
    CleanupNow,
}

/// The standalone CLI has no application-level handler registrations to
/// ask the ORM about; `reconcile-now` against an empty discovery result
/// only ever drops obsolete `<prefix>_*` triggers, never installs new
/// ones. An embedding application reconciles through the library crates
/// directly, with its own `OrmMetadataProvider`.
struct EmptyOrm;

impl OrmMetadataProvider for EmptyOrm {
    fn table_descriptor(&self, _entity_target: &str) -> Option<TableDescriptor> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let loaded = pubsub_config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let config = loaded.config;

    let connect_options = pubsub_config::pg_connect_options(&config)
        .context("failed to build database connection options")?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options)
        .await
        .context("failed to connect to database")?;

    match cli.cmd {
        Commands::ReconcileNow => {
            let queue = QueueService::new(pool.clone(), config.clone())?;
            queue.setup().await.context("failed to set up queue table")?;

            let discovery = discover(Vec::new(), &EmptyOrm, &config.trigger_schema)
                .context("discovery failed")?;
            let lock = AdvisoryLockService::new(pool.clone());
            let trigger_service = TriggerService::new(pool, lock, config);
            trigger_service.reconcile(&discovery).await.context("reconciliation failed")?;
            println!("reconciliation complete");
        }

        Commands::QueueStats => {
            let queue = QueueService::new(pool, config)?;
            queue.setup().await.context("failed to set up queue table")?;
            let stats = queue.stats().await.context("failed to read queue stats")?;
            println!("pending={}", stats.pending);
            println!("processing={}", stats.processing);
            println!("processed={}", stats.processed);
            println!("failed={}", stats.failed);
        }

        Commands::CleanupNow => {
            let queue = QueueService::new(pool, config)?;
            queue.setup().await.context("failed to set up queue table")?;
            let deleted = queue.cleanup().await.context("cleanup failed")?;
            println!("deleted={deleted}");
        }
    }

    Ok(())
}
