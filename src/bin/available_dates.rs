use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use dustwarning::api;
use dustwarning::config;
use dustwarning::db;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the forecast dates available from the latest synced run as JSON"
)]
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
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let dates = api::available_dates(&pool).await?;
    println!("{}", serde_json::to_string(&dates)?);
    Ok(())
}
