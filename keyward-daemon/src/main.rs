//! Keyward Daemon
//!
//! Background service that owns the token store and exposes the
//! orchestrator over a local JSON-RPC socket.
//!
//! # Running
//!
//! ```bash
//! cargo run -p keyward-daemon
//! # or after install:
//! keywardd --config ~/.config/keyward/daemon.toml
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use keyward_core::Orchestrator;
use keyward_daemon::config::{self, DaemonConfig};
use keyward_daemon::{ApiState, start_server};

/// How often abandoned handshakes are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser)]
#[command(name = "keywardd")]
#[command(about = "Keyward credential daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the socket path from the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Override the log level from the configuration
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level);

    info!("Starting Keyward daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    run_daemon(config).await
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Daemon starting on {:?}", config.socket_path);

    let state = ApiState::new(&config).await?;
    let pruner = tokio::spawn(prune_periodically(
        state.orchestrator.clone(),
        state.request_token_ttl,
    ));

    let server_handle = start_server(&config.socket_path, state).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    pruner.abort();
    server_handle.stop().await?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
        info!("Socket file removed");
    }

    info!("Daemon stopped");
    Ok(())
}

/// Delete request tokens left behind by handshakes that never came back.
async fn prune_periodically(orchestrator: Arc<Orchestrator>, max_age: chrono::Duration) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = orchestrator.prune_request_tokens(max_age).await {
            warn!("Pruning request tokens failed: {}", e);
        }
    }
}
