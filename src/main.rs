//! ethgate - WebSocket failover gateway
//!
//! Entry point for the gateway server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;

use ethgate::config::{Config, Strategy};
use ethgate::proxy;
use ethgate::state::AppState;

/// ethgate - WebSocket failover gateway
#[derive(Parser, Debug)]
#[command(name = "ethgate")]
#[command(
    about = "A failover gateway that keeps a JSON-RPC WebSocket client connected to a healthy upstream Ethereum node"
)]
struct Args {
    /// Upstream WebSocket endpoints in priority order (ws:// or wss://)
    #[arg(required = true)]
    endpoints: Vec<String>,

    /// The endpoint selection strategy to use
    #[arg(long, value_enum, default_value_t = Strategy::PrimaryInstant)]
    strategy: Strategy,

    /// Maximum failed attempts before connecting to the next endpoint (primary-* strategies)
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Seconds between reconnect attempts to the primary endpoint (primary-async strategy)
    #[arg(long, default_value_t = 3)]
    reconnect_timeout: u64,

    /// Port to start the WebSocket server on
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Seconds without a block header notification before disconnecting
    #[arg(long, default_value_t = 300)]
    header_timeout: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Parse CLI arguments
    let args = Args::parse();

    let config = Config {
        strategy: args.strategy,
        max_attempts: args.max_attempts,
        reconnect_timeout: Duration::from_secs(args.reconnect_timeout),
        port: args.port,
        header_timeout: Duration::from_secs(args.header_timeout),
        endpoints: args.endpoints,
    };
    config.validate()?;

    for endpoint in &config.endpoints {
        info!(url = %endpoint, "adding upstream endpoint");
    }

    info!(
        strategy = %config.strategy,
        max_attempts = config.max_attempts,
        reconnect_timeout_s = config.reconnect_timeout.as_secs(),
        header_timeout_s = config.header_timeout.as_secs(),
        "configuration loaded"
    );

    let port = config.port;
    let state = Arc::new(AppState::new(config));

    // Build the router
    let app = proxy::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "starting WebSocket server");

    // Create the TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ethgate shut down gracefully");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
