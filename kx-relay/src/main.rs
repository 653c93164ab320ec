//! kx-relay binary entry point.
//!
//! Usage:
//! ```bash
//! kx-relay --config relay.toml
//! RUST_LOG=keyexchange_relay=debug kx-relay
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use keyexchange_relay::config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Channel relay for two-party key-exchange handshakes.
#[derive(Parser, Debug)]
#[command(name = "kx-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        tracing::warn!(
            "{} not found, running with default configuration",
            cli.config.display()
        );
        Config::default()
    };

    keyexchange_relay::server::serve(config, shutdown_signal())
        .await
        .context("Relay failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
