//! Application state shared by the HTTP handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::submission::TaskSubmission;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,

    pub store: Arc<dyn TaskStore>,

    pub submission: TaskSubmission,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        store: Arc<dyn TaskStore>,
        submission: TaskSubmission,
        config: AppConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            submission,
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
