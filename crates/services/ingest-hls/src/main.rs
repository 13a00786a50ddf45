//! Live Ingest HLS Gateway Binary
//!
//! Entry point for the live ingest gateway service.
//!
//! Configuration is read from the TOML file named by `INGEST_CONFIG` or the
//! first argument, falling back to `INGEST_*` environment variables.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remotemedia_ingest_hls::{
    api::{build_router, AppState},
    config::Config,
    controller::StreamController,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Live Ingest HLS Gateway...");

    // Load configuration
    let config_path = std::env::var("INGEST_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));
    let config = Arc::new(Config::load(config_path.as_deref())?);

    tracing::info!(
        "Configuration: HTTP port={}, streams_dir={}, ffmpeg={}, max_sessions={}",
        config.server.http_port,
        config.storage.streams_dir.display(),
        config.encoder.ffmpeg_path,
        config.limits.max_sessions
    );

    tokio::fs::create_dir_all(&config.storage.streams_dir).await?;

    let controller = Arc::new(StreamController::from_config(&config));

    // Create app state
    let state = AppState::new(controller.clone(), config.clone());

    // Build HTTP router
    let router = build_router(state);

    // Start HTTP server
    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    // Close every sink, then wait for the encoders to finalize and exit
    controller.shutdown().await;

    tracing::info!("Live Ingest HLS Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
