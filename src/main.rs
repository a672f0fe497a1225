use anyhow::{Context, Result};
use clap::Parser;
use contentsync::app;
use contentsync::config;
use contentsync::queue;
use contentsync::server::{self, ApiState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(author, version, about)]
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
    let app = app::build(&cfg).await?;

    // Queue worker; the only task that enters blog contexts
    let worker_pool = app.pool.clone();
    let worker = app.distributor.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    tokio::spawn(async move {
        loop {
            match queue::process_next_task(&worker_pool, &worker, max_backoff).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "queue worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let sweeper = app.distributor.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.sweep().await {
                error!(?err, "retention sweep failed");
            }
        }
    });

    let bind: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind address {}", cfg.server.bind))?;
    let state = Arc::new(ApiState {
        distributor: app.distributor.clone(),
        token: cfg.server.token.clone(),
    });
    info!(network_url = %cfg.site.network_url, "starting content sync");
    tokio::select! {
        res = server::serve(bind, state) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
