use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hnsync_core::SourceKind;
use hnsync_storage::PgPostStore;
use hnsync_sync::{SyncConfig, SyncPipeline};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "hnsync-cli")]
#[command(about = "Hacker News ingestion: sync, serve, schedule, migrate")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion and wait for its enrichment to finish.
    Sync {
        #[arg(long, default_value = "scraper")]
        source: SourceKind,
    },
    /// Serve the JSON API; also runs the scheduler when enabled.
    Serve,
    /// Run only the cron scheduler until Ctrl-C.
    Schedule,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(logging::LogFormat::from_env()?)?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        source: SourceKind::Scraper,
    }) {
        Commands::Sync { source } => {
            let report = hnsync_sync::run_sync_once_from_env(source).await?;
            println!(
                "sync complete: run_id={} source={} observed={} removed={} pages={}",
                report.run_id, report.source, report.observed, report.removed, report.pages
            );
        }
        Commands::Serve => hnsync_web::serve_from_env().await?,
        Commands::Schedule => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set HNSYNC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let Some(url) = SyncConfig::from_env().database_url else {
                bail!("DATABASE_URL must be set to migrate");
            };
            let store = PgPostStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}
