//! sqlgated
//!
//! Serves the task API and runs the action scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlgate_orchestrator::{
    config::{AppConfig, DatabaseConfig, StoreKind},
    drivers::DriverRegistry,
    handlers,
    model::Instance,
    scheduler::Scheduler,
    state::AppState,
    store::{create_pool, MemoryTaskStore, PgTaskStore, TaskStore},
    submission::TaskSubmission,
    workflow::Workflows,
};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlgate_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open the configured task store.
///
/// The in-memory store registers the instances of `SQLGATE_INSTANCES`. Without
/// them it falls back to one `<db_type>_local` instance per backend, which
/// carries no connection settings.
async fn open_store(config: &AppConfig, drivers: &DriverRegistry) -> anyhow::Result<Arc<dyn TaskStore>> {
    match config.store_kind()? {
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory task store, tasks are lost on restart");
            let store = MemoryTaskStore::new();

            let mut instances = config.instances()?;
            if instances.is_empty() {
                tracing::warn!(
                    "SQLGATE_INSTANCES is not set, local instances have no connection settings \
                     and only suit backends that need none"
                );
                instances = drivers
                    .db_types()
                    .into_iter()
                    .map(|db_type| Instance {
                        name: format!("{}_local", db_type),
                        db_type,
                        ..Default::default()
                    })
                    .collect();
            }

            for instance in instances {
                if !drivers.db_types().contains(&instance.db_type) {
                    tracing::warn!(instance = %instance.name, db_type = %instance.db_type, "No driver backend for instance");
                }
                let instance = store.add_instance(instance, Vec::new()).await;
                tracing::info!(instance = %instance.name, db_type = %instance.db_type, "Registered instance");
            }
            Ok(Arc::new(store))
        }
        StoreKind::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            tracing::info!(url = %db_config.display_url(), "Connecting to task store");

            let store = PgTaskStore::new(create_pool(&db_config).await?);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting sqlgated");

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        queue_capacity = app_config.queue_capacity,
        store = %app_config.store,
        "Configuration loaded"
    );

    let drivers = DriverRegistry::remote(&app_config.driver_endpoints()?, app_config.driver_timeout());
    if drivers.db_types().is_empty() {
        tracing::warn!("No driver backends configured, set SQLGATE_DRIVERS");
    }

    let store = open_store(&app_config, &drivers).await?;

    let workflows = Arc::new(Workflows::new(store.clone(), drivers.clone()));
    let scheduler = Arc::new(Scheduler::from_config(store.clone(), workflows, &app_config));
    scheduler.start()?;

    let submission = TaskSubmission::new(store.clone(), drivers);
    let addr: SocketAddr = app_config.bind_address().parse()?;
    let state = AppState::new(scheduler.clone(), store, submission, app_config);
    let app = handlers::router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "sqlgated listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    tracing::info!("sqlgated stopped");
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
