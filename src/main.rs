//! Collaboration hub server - Entry Point
//!
//! Parses configuration, builds the hub and serves until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use collab_hub::{AppError, Hub, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=collab_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collab_hub=info")),
        )
        .init();

    let config = ServerConfig::parse();
    let hub_config = config.hub_config()?;
    let verifier = config.verifier()?;
    if verifier.is_empty() {
        warn!("No tokens configured (HUB_TOKENS); every auth request will fail");
    }

    let listener = TcpListener::bind(&config.bind).await?;
    info!("Collaboration hub listening on {}", config.bind);

    let hub = Arc::new(Hub::new(hub_config));
    let server = Server::new(hub, verifier);

    let result = server.run(listener, shutdown_signal()).await;
    if let Err(e) = &result {
        error!("Server error: {}", e);
    }
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
