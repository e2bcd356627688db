//! Lantas - Entry Point
//!
//! Loads the configuration, starts every server and runs until Ctrl+C or SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lantas::config::{LogConfig, Runtime};
use lantas::Lantas;

#[derive(Parser, Debug)]
#[command(name = "lantas", version)]
#[command(about = "Configurable TCP/TLS reverse proxy")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "LANTAS_CONFIG_FILE")]
    config_file: PathBuf,

    /// Directory relative TLS credential paths are resolved against
    #[arg(long, env = "LANTAS_ROOT_DIR", default_value = ".")]
    root_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = Runtime::from_file(&args.config_file)
        .with_context(|| format!("failed to load {}", args.config_file.display()))?;
    init_tracing(&runtime.log.clone().with_env_overrides());

    info!(config = %args.config_file.display(), "Starting Lantas");

    let mut lantas = Lantas::new(runtime, args.root_dir);
    if let Err(e) = lantas.init().await {
        error!(error = %e, "Initialization failed");
        return Err(e).context("failed to start servers");
    }
    info!(servers = lantas.servers().len(), "Lantas is running");

    shutdown_signal().await;
    info!("Shutdown signal received");

    lantas.shutdown();
    lantas.wait().await;

    info!("Lantas stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("lantas={}", log.level))
            .unwrap_or_else(|_| EnvFilter::new("lantas=info"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.is_json() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
