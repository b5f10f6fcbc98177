//! UniLink Hub - Main entry point.
//!
//! This binary starts the notification hub with:
//! - Structured JSON logging
//! - A REST-backed directory when one is configured
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`unilink_hub::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! UNILINK_JWT_SECRET="shared-secret" \
//! UNILINK_SERVICE_TOKEN="publisher-token" \
//! UNILINK_DIRECTORY_URL="https://db.example.edu" \
//! UNILINK_DIRECTORY_KEY="service-role-key" \
//! PORT=8080 \
//! cargo run --release --bin unilink-hub
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use unilink_hub::config::Config;
use unilink_hub::directory::{Directory, InMemoryDirectory, RestDirectory};
use unilink_hub::hub::{Hub, HubConfig};
use unilink_hub::routes::{create_router, AppState};

/// How long the hub gets to close sessions after the server stops.
const HUB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  UNILINK_JWT_SECRET          - HS256 secret shared with the REST backend");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  UNILINK_SERVICE_TOKEN       - Bearer token for POST /events");
            eprintln!("  UNILINK_DIRECTORY_URL       - Directory REST API base URL");
            eprintln!("  UNILINK_DIRECTORY_KEY       - Directory REST API key (required with URL)");
            eprintln!("  PORT                        - HTTP server port (default: 8080)");
            eprintln!("  UNILINK_SESSION_QUEUE       - Per-session queue size (default: 256)");
            eprintln!("  UNILINK_HUB_QUEUE           - Hub event queue size (default: 1024)");
            eprintln!("  UNILINK_PING_INTERVAL_SECS  - Keepalive period (default: 54)");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    let directory = match build_directory(&config) {
        Ok(directory) => directory,
        Err(err) => {
            error!(error = %err, "Failed to create directory client");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        session_queue = config.session_queue,
        hub_queue = config.hub_queue,
        ping_interval_secs = config.ping_interval.as_secs(),
        publishing_enabled = config.service_token.is_some(),
        "UniLink hub starting"
    );

    let (hub, hub_task) = Hub::spawn(Arc::clone(&directory), HubConfig::from(&config));
    let state = AppState::new(config.clone(), hub.clone(), directory);
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let shutdown_hub = hub.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Closing sessions lets their sockets finish, which graceful
        // shutdown waits for.
        shutdown_hub.shutdown();
    });

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    hub.shutdown();
    if tokio::time::timeout(HUB_SHUTDOWN_TIMEOUT, hub_task)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = HUB_SHUTDOWN_TIMEOUT.as_secs(),
            "Hub did not stop in time"
        );
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Picks the directory backend from configuration.
fn build_directory(
    config: &Config,
) -> Result<Arc<dyn Directory>, unilink_hub::directory::DirectoryError> {
    match (&config.directory_url, &config.directory_key) {
        (Some(url), Some(key)) => {
            let directory = RestDirectory::new(url.clone(), key.clone())?;
            info!(base_url = directory.base_url(), "Using REST directory");
            Ok(Arc::new(directory))
        }
        _ => {
            warn!("Using empty in-memory directory");
            Ok(Arc::new(InMemoryDirectory::new()))
        }
    }
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received.
///
/// If a handler cannot be installed the error is logged and that signal is
/// ignored; the other one still triggers shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
