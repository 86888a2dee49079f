//! Main entry point for the arena-room matchmaking service
//!
//! Runs the matchmaker as a standalone node with the local backends, waits
//! for shutdown signals and tears the cluster membership down cleanly.

use anyhow::Result;
use arena_room::config::AppConfig;
use arena_room::service::AppState;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Arena Room - distributed matchmaking and room lifecycle core
#[derive(Parser)]
#[command(
    name = "arena-room",
    version,
    about = "Distributed matchmaking and room-lifecycle node",
    long_about = "Arena Room runs one matchmaking node: it registers room types, \
                 places new rooms on the least-loaded node in the cluster, routes \
                 seat reservations over the presence substrate, and cleans up \
                 rooms on shutdown."
)]
struct Args {
    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Address to advertise on the discovery channel
    #[arg(long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Port to advertise on the discovery channel
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Override the remote room timeout in milliseconds
    #[arg(long, value_name = "MS")]
    remote_room_timeout_ms: Option<u64>,

    /// Enable debug mode with verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit without starting the service
    #[arg(long)]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| anyhow::anyhow!("Failed to initialize logging: {}", error))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("Arena Room matchmaking node");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Node: {}:{}", config.node.address, config.node.port);
    info!(
        "   Remote room timeout: {}ms",
        config.matchmaking.remote_room_timeout_ms
    );
    info!(
        "   Max join attempts: {}",
        config.matchmaking.max_join_attempts
    );
}

/// Load configuration from the environment and apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::from_env()?;

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if args.debug {
        config.service.log_level = "debug".to_string();
    }
    if let Some(address) = &args.address {
        config.node.address = address.clone();
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(timeout) = args.remote_room_timeout_ms {
        config.matchmaking.remote_room_timeout_ms = timeout;
    }

    arena_room::config::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|error| {
        eprintln!("Configuration error: {}", error);
        std::process::exit(1);
    });

    if let Err(error) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", error);
        std::process::exit(1);
    }

    display_startup_banner(&config);

    if args.dry_run {
        info!("Configuration validation successful");
        info!("Dry run completed - exiting without starting the service");
        return Ok(());
    }

    let app_state = match AppState::new(config.clone()) {
        Ok(state) => Arc::new(state),
        Err(error) => {
            error!("Failed to initialize application: {}", error);
            std::process::exit(1);
        }
    };

    if let Err(error) = app_state.start().await {
        error!("Failed to start service: {}", error);
        std::process::exit(1);
    }

    info!("Arena Room node is running, press Ctrl+C to shut down");
    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, beginning graceful shutdown");
    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("Graceful shutdown completed"),
        Ok(Err(error)) => warn!("Shutdown finished with errors: {}", error),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    Ok(())
}
