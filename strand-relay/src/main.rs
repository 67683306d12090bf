//! strand-relay binary entry point.
//!
//! Usage:
//! ```bash
//! strand-relay --config relay.toml
//! strand-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strand_relay::cleanup::spawn_cleanup_task;
use strand_relay::config::Config;
use strand_relay::http::{self, health};
use strand_relay::server::Relay;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Access-controlled publish/subscribe event relay.
#[derive(Parser, Debug)]
#[command(name = "strand-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        tracing::warn!(
            "Configuration file {} not found, using defaults",
            cli.config.display()
        );
        Config::default()
    };

    health::init_start_time();

    let bind_address = config.server.bind_address.clone();
    let cleanup = config.cleanup.clone();
    let relay = Arc::new(Relay::open(config).await?);
    let cleanup_handle = spawn_cleanup_task(
        relay.store().clone(),
        relay.rate_limits().clone(),
        cleanup,
    );

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(
        "strand-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        bind_address
    );

    http::serve(relay, listener, shutdown_signal()).await?;

    cleanup_handle.abort();
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
