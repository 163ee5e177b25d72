use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use dustwarning::config;
use dustwarning::db;
use dustwarning::source::HttpForecastSource;
use dustwarning::sync::{SyncOutcome, Synchronizer};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single warning sync for the next init date and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Pretend the current time is this RFC 3339 timestamp
    #[arg(long)]
    now: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let now = match args.now.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("--now '{raw}' is not RFC 3339"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let source = Arc::new(HttpForecastSource::from_config(&cfg.source)?);
    let synchronizer = Synchronizer::from_config(&cfg, pool, source)?;

    info!(cursor = ?synchronizer.cursor().read(), "starting warning sync");

    // Aborted runs are logged by the synchronizer and retried by the next
    // invocation, so they do not fail the process.
    match synchronizer.run_at(now).await {
        SyncOutcome::Completed(report) => {
            info!(init_date = %report.init_date, "warning sync completed");
        }
        SyncOutcome::Gated { target, .. } => {
            info!(%target, "warning sync skipped before cutoff");
        }
        SyncOutcome::Aborted { target, .. } => {
            info!(%target, "warning sync aborted; will retry on next invocation");
        }
    }
    Ok(())
}
