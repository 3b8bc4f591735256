//! Parley Server - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use parley_server::engine::local::LocalEngine;
use parley_server::engine::MediaEngine;
use parley_server::session::RoomRegistry;
use parley_server::ws::{self, GatewayState};
use parley_server::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Parley Server"
    );

    // Development engine; a production SFU backend plugs in through the
    // same MediaEngine trait.
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());

    // Engine worker death is fatal; give the log pipeline a moment to flush.
    engine
        .on_died(Box::new(|| {
            Box::pin(async {
                error!("Media engine died, exiting in 2 seconds");
                tokio::time::sleep(Duration::from_secs(2)).await;
                std::process::exit(1);
            })
        }))
        .await;

    let registry = Arc::new(RoomRegistry::new(engine, config.clone()));
    let app = ws::router(GatewayState { registry });

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Server shutdown complete");

    Ok(())
}
