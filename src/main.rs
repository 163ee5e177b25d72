use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dustwarning::config;
use dustwarning::db;
use dustwarning::source::HttpForecastSource;
use dustwarning::sync::{SyncOutcome, Synchronizer};

#[derive(Debug, Parser)]
#[command(author, version, about = "Periodically sync dust-warning forecasts")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let source = Arc::new(HttpForecastSource::from_config(&cfg.source)?);
    let synchronizer = Synchronizer::from_config(&cfg, pool, source)?;
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!(
        boundary_sets = cfg.boundaries.len(),
        poll_interval_ms = cfg.app.poll_interval_ms,
        "starting warning sync worker"
    );

    // Runs are strictly sequential, so two runs never race on the cursor.
    loop {
        match synchronizer.run().await {
            // Caught up by one day; try the next one straight away.
            SyncOutcome::Completed(_) => continue,
            SyncOutcome::Gated { .. } | SyncOutcome::Aborted { .. } => {
                tokio::time::sleep(poll_sleep).await;
            }
        }
    }
}
