use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobboard_ingest::{IngestConfig, IngestionOrchestrator, IntervalTrigger, RecurringIngestion};
use jobboard_store::{JobStore, MemoryJobStore, PgJobStore};
use jobboard_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobboard-cli")]
#[command(about = "Job board aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and print the per-org report.
    Ingest,
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API, with recurring ingestion when SCHEDULER_ENABLED.
    Serve {
        /// Keep jobs in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
        /// Overrides JOBBOARD_WEB_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = jobboard_ingest::run_ingest_once_from_env().await?;
            println!("{report}");
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            connect_and_migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve { memory, port } => {
            let config = IngestConfig::from_env();
            let store: Arc<dyn JobStore> = if memory {
                info!("using in-memory job store");
                Arc::new(MemoryJobStore::default())
            } else {
                Arc::new(connect_and_migrate(&config).await?)
            };

            let scheduler = if config.scheduler_enabled {
                let orchestrator = IngestionOrchestrator::from_config(&config, store.clone())?;
                info!(interval_hours = config.interval_hours, "starting recurring ingestion");
                Some(RecurringIngestion::new(Arc::new(orchestrator), IntervalTrigger::new(config.interval())).spawn())
            } else {
                None
            };

            let port = port.unwrap_or_else(jobboard_web::port_from_env);
            let state = AppState::from_config(&config, store);
            let served = jobboard_web::serve(state, port, shutdown_signal()).await;

            if let Some(handle) = scheduler {
                handle.abort();
            }
            served.context("serving api")?;
        }
    }

    Ok(())
}

async fn connect_and_migrate(config: &IngestConfig) -> Result<PgJobStore> {
    let store = PgJobStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
