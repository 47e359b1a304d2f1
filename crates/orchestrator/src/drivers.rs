//! Driver backends by database type, and the sessions workflows run on.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use sqlgate_driver::protocol::InitRequest;
use sqlgate_driver::{Driver, DriverFactory, RemoteDriverFactory};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Instance, TaskId};

/// Maps an instance's `db_type` to the backend that serves it.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of remote backends from `(db_type, url)` pairs.
    pub fn remote(endpoints: &[(String, String)], timeout: Duration) -> Self {
        let mut registry = Self::new();
        for (db_type, url) in endpoints {
            tracing::info!(db_type = %db_type, url = %url, "Registered driver backend");
            registry.register(db_type, Arc::new(RemoteDriverFactory::new(db_type, url, timeout)));
        }
        registry
    }

    pub fn register(&mut self, db_type: &str, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(db_type.to_string(), factory);
    }

    pub fn db_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn factory(&self, db_type: &str) -> OrchestratorResult<Arc<dyn DriverFactory>> {
        self.factories
            .get(db_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::DriverNotFound(db_type.to_string()))
    }

    /// Create a driver for `instance` and `Init` it on `schema`.
    pub async fn open(&self, instance: &Instance, schema: &str) -> OrchestratorResult<DriverSession> {
        let driver = self.factory(&instance.db_type)?.create();

        driver
            .init(InitRequest {
                host: instance.host.clone(),
                port: instance.port.clone(),
                user: instance.user.clone(),
                password: instance.password.clone(),
                database: schema.to_string(),
            })
            .await?;

        tracing::debug!(
            instance = %instance.name,
            db_type = %instance.db_type,
            schema = %schema,
            "Driver session opened"
        );

        Ok(DriverSession {
            driver,
            instance: instance.name.clone(),
            closed: false,
        })
    }
}

/// An initialized driver owned by one workflow run.
///
/// [`DriverSession::close`] must be called when the run ends. A session that
/// is dropped while still open closes itself in the background.
pub struct DriverSession {
    driver: Arc<dyn Driver>,
    instance: String,
    closed: bool,
}

impl DriverSession {
    /// Release the backend connection.
    pub async fn close(mut self) -> OrchestratorResult<()> {
        self.closed = true;
        self.driver.close().await?;
        Ok(())
    }

    /// Close, logging instead of returning a failure.
    pub async fn close_logged(self, task_id: TaskId) {
        let instance = self.instance.clone();
        if let Err(e) = self.close().await {
            tracing::warn!(task_id, instance = %instance, error = %e, "Failed to close driver session");
        }
    }
}

impl Deref for DriverSession {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        tracing::warn!(instance = %self.instance, "Driver session dropped without close");
        let driver = self.driver.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = driver.close().await {
                    tracing::warn!(error = %e, "Background driver close failed");
                }
            });
        }
    }
}
