//! SparkLoop Relay web server.
//!
//! Receives Ghost member webhooks and direct subscriber calls and forwards
//! them to SparkLoop.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sparkrelay::{app_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("relay_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        auth_configured = config.auth_token.is_some(),
        sparkloop_key_configured = config.sparkloop_api_key.is_some(),
        sparkloop_api_base = %config.sparkloop_api_base,
        discord_configured = config.discord_webhook_url.is_some(),
        slack_configured = config.slack_webhook_url.is_some(),
        rate_limit_max = config.rate_limit_max,
        rate_limit_window_ms = config.rate_limit_window_ms,
        "config_loaded"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::from_config(config)?;
    let app = app_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "relay_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("relay_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
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
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("relay_shutting_down");
}
