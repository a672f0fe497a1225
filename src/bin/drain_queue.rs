use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use contentsync::app;
use contentsync::config;
use contentsync::db;
use contentsync::queue;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run every due distribution task and exit when none are left"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also delete items past the retention period before exiting
    #[arg(long)]
    sweep: bool,
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
    let app = app::build(&cfg).await?;
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    let pending = db::count_pending_tasks(&app.pool).await?;
    info!(pending, "draining distribution queue");

    let processed = queue::drain(&app.pool, &app.distributor, max_backoff).await?;
    let left = db::count_pending_tasks(&app.pool).await?;
    info!(processed, left, "queue drained");

    if args.sweep {
        let removed = app.distributor.sweep().await?;
        info!(removed, "retention sweep done");
    }
    Ok(())
}
