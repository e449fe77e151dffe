// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - Daemon
// Serves the tunnel list, tunnel status and tunnel logs over HTTP

mod api;
mod config;
mod permissions;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use config::{DaemonConfig, StatusMode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_panel_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tunnel Panel Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load daemon configuration
    let daemon_config = DaemonConfig::load()?;
    info!("Tunnel document: {}", daemon_config.config_file_path().display());
    info!("Backups: {}", daemon_config.backup_dir_path().display());
    info!("Fingerprint protocol: {}", daemon_config.fingerprint_protocol);
    match daemon_config.status.mode {
        StatusMode::Logs => info!("Status source: logs in {}", daemon_config.logs_dir.display()),
        StatusMode::Remote => info!(
            "Status source: remote {}",
            daemon_config
                .status
                .remote_base_url
                .as_deref()
                .unwrap_or("(not configured)")
        ),
    }

    // Nothing is served until the config directory checks out
    permissions::check_config_directory(&daemon_config.config_dir)
        .context("Config directory failed the startup check")?;

    if !daemon_config.logs_dir.is_dir() {
        warn!(
            "Logs directory {} does not exist yet; tunnels will report no log",
            daemon_config.logs_dir.display()
        );
    }

    let state = Arc::new(AppState::from_config(&daemon_config)?);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    serve_tcp_http(app, &daemon_config.bind_address).await?;

    info!("Daemon shut down");
    Ok(())
}

/// Serve on TCP with plain HTTP
async fn serve_tcp_http(app: axum::Router, bind_address: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    };
}
