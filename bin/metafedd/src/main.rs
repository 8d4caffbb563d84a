//! MetaFed Federation Daemon
//!
//! Loads the federation configuration, brings up every configured
//! backend with its worker pool, and runs until interrupted. Status
//! snapshots are logged periodically as JSON.

use anyhow::Result;
use clap::Parser;
use metafed_common::Config;
use metafed_core::{ClientRegistry, Federator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "metafedd")]
#[command(about = "MetaFed Federation Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/metafed/metafed.toml")]
    config: PathBuf,

    /// Seconds between status reports (0 disables)
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MetaFed Federation Daemon");

    let cfg = Config::load(&args.config)?;
    info!(
        backends = cfg.backends.len(),
        cache_capacity = cfg.cache.max_items,
        "configuration loaded"
    );

    let registry = ClientRegistry::builtin();
    let fed = Arc::new(Federator::new(cfg, &registry)?);
    fed.start();

    if args.status_interval > 0 {
        let fed = Arc::clone(&fed);
        let mut interval = tokio::time::interval(Duration::from_secs(args.status_interval));
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                interval.tick().await;
                match serde_json::to_string(&fed.status()) {
                    Ok(s) => info!(status = %s, "federation status"),
                    Err(e) => warn!(error = %e, "failed to serialize status"),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let fed = Arc::clone(&fed);
    tokio::task::spawn_blocking(move || fed.stop()).await?;
    info!("Shutdown complete");
    Ok(())
}
