use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_storage::PgJobStore;
use jobfeed_sync::{orchestrator_from_env, SyncConfig, DEFAULT_LIST_LIMIT};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobfeed-cli")]
#[command(about = "Job listing ingestion feed command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and upsert the results.
    Refresh,
    /// Print enhanced listings as JSON.
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Run the HTTP API (and the refresh cron when enabled).
    Serve,
    /// Create the jobs table in DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let summary = jobfeed_sync::run_refresh_once_from_env().await?;
            println!(
                "refresh complete: run_id={} written={} failed={} fallback={}",
                summary.run_id, summary.written, summary.failed_writes, summary.used_fallback
            );
            for source in &summary.sources {
                match &source.failure {
                    Some(reason) => warn!(source = %source.source, %reason, "source failed"),
                    None => info!(source = %source.source, fetched = source.fetched, "source fetched"),
                }
            }
        }
        Commands::List { limit } => {
            let (_config, orchestrator) = orchestrator_from_env().await?;
            let read = orchestrator.list_jobs(limit).await;
            let text = serde_json::to_string_pretty(&read.jobs).context("encoding listings")?;
            println!("{text}");
        }
        Commands::Serve => {
            jobfeed_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            PgJobStore::connect(&url).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
