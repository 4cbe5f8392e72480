//! Loopline Daemon - local backend serving UI and connector processes.
//!
//! Listens on the per-user loopline endpoint (Unix socket or named pipe),
//! publishes a discovery file so clients can find it, and serves the
//! built-in routes until interrupted.

mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use loopline_core::{IpcServer, ServerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "loopline-daemon")]
#[command(about = "Local IPC daemon for loopline clients")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Runtime directory for the socket and discovery file
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Socket path or pipe name (overrides the configured address)
    #[arg(long)]
    address: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(dir) = &args.runtime_dir {
        config.runtime_dir = Some(dir.clone());
    }
    if let Some(address) = &args.address {
        config.address = Some(address.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting loopline daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let builder = IpcServer::builder(config);
    let state = routes::DaemonState::new(builder.connections());
    let router = routes::build_router(state).context("Failed to register routes")?;

    let server = builder
        .router(router)
        .build()
        .context("Invalid server configuration")?
        .start()
        .await
        .context("Failed to start IPC server")?;

    // Address handshake for a parent process reading stdout
    println!("LOOPLINE_ADDRESS={}", server.address());

    info!("Daemon listening on {}", server.address());
    if let Some(path) = server.discovery_path() {
        info!("Discovery file: {}", path.display());
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining connections");

    let report = server.shutdown().await?;
    info!(
        "Shutdown complete in {:?} (drained: {}, aborted: {})",
        report.elapsed, report.drained, report.aborted_connections
    );

    Ok(())
}
