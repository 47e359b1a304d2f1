//! Standalone host for the in-process memory backend.
//!
//! Useful for running the orchestrator locally without a real database:
//! point `SQLGATE_DRIVERS` at `memory=http://<DRIVER_HOST>:<DRIVER_PORT>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlgate_driver::server::{self, DriverHost};
use sqlgate_driver::{MemoryDriverFactory, MemoryState};

/// Host configuration, read from `DRIVER_*` variables.
#[derive(Debug, Deserialize)]
struct HostConfig {
    #[serde(default = "default_host")]
    host: String,

    #[serde(default = "default_port")]
    port: u16,

    /// Comma separated databases reported by `Databases`.
    #[serde(default)]
    databases: Option<String>,

    /// Sessions with no call for this long are closed.
    #[serde(default = "default_idle_timeout_secs")]
    session_idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10001
}

fn default_idle_timeout_secs() -> u64 {
    server::DEFAULT_IDLE_TIMEOUT.as_secs()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            databases: None,
            session_idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlgate_driver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = envy::prefixed("DRIVER_")
        .from_env::<HostConfig>()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load driver host config, using defaults");
            HostConfig::default()
        });

    let state = MemoryState::new();
    if let Some(databases) = &config.databases {
        let names: Vec<&str> = databases
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        state.set_databases(&names);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %addr,
        "Memory driver listening"
    );

    let host = DriverHost::new(Arc::new(MemoryDriverFactory::new(state)))
        .with_idle_timeout(Duration::from_secs(config.session_idle_timeout_secs));
    server::serve(listener, host, shutdown_signal()).await?;

    tracing::info!("Memory driver stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
