//! Main entry point for the replicated key-value node
//!
//! This module initializes the service, handles configuration, and
//! manages the server lifecycle.

use clap::Parser;
use tokio::signal;

use kvnode::config::RuntimeConfig;
use kvnode::server::Server;

/// Handles graceful shutdown signals
///
/// This function listens for Ctrl+C and SIGTERM signals on Unix systems,
/// allowing the service to shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Command line arguments for the service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config);

    let mut server = Server::start(config).await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}
