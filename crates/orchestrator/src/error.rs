//! Error types for the sqlgate orchestrator.
//!
//! Scheduler validation errors, workflow errors and collaborator failures
//! share one enum so that the caller of `enqueue_and_wait` receives exactly
//! the value the workflow produced. `IntoResponse` maps each kind onto the
//! HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlgate_driver::DriverError;
use thiserror::Error;

use crate::model::{ActionKind, TaskId, TaskStatus};

/// Orchestrator-level errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The task already has an action in flight.
    #[error("Task {0} is running")]
    TaskRunning(TaskId),

    #[error("Task {0} does not exist")]
    TaskNotExist(TaskId),

    /// The task status forbids the requested action.
    #[error("Action {action} is not allowed for task {task_id} in status {status}: {reason}")]
    ActionNotAllowed {
        task_id: TaskId,
        action: ActionKind,
        status: TaskStatus,
        reason: String,
    },

    /// DML and DDL statements in one batch.
    #[error("SQL type conflict: DML and DDL statements can not be executed in one task")]
    SqlTypeConflict,

    /// Procedure or function definitions mixed with other statements.
    #[error("SQL type conflict: procedure and function definitions must be executed alone")]
    ProcedureFunctionConflict,

    #[error("Instance {0} does not exist")]
    InstanceNotExist(String),

    /// No backend registered for the instance's database type.
    #[error("No driver registered for database type {0}")]
    DriverNotFound(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The action queue stayed full past the enqueue timeout.
    #[error("Action queue is full")]
    QueueFull,

    #[error("Scheduler is stopped")]
    SchedulerStopped,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::TaskRunning(_) => StatusCode::CONFLICT,
            OrchestratorError::TaskNotExist(_) | OrchestratorError::InstanceNotExist(_) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::ActionNotAllowed { .. }
            | OrchestratorError::SqlTypeConflict
            | OrchestratorError::ProcedureFunctionConflict
            | OrchestratorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::DriverNotFound(_) | OrchestratorError::Driver(_) => {
                StatusCode::BAD_GATEWAY
            }
            OrchestratorError::QueueFull | OrchestratorError::SchedulerStopped => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Storage(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            OrchestratorError::Storage(msg) => tracing::error!(error = %msg, "Storage error"),
            OrchestratorError::Internal(msg) => tracing::error!(error = %msg, "Internal error"),
            OrchestratorError::Config(msg) => tracing::error!(error = %msg, "Configuration error"),
            OrchestratorError::Driver(e) => tracing::warn!(error = %e, "Driver error"),
            _ => {}
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using OrchestratorError.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

impl From<envy::Error> for OrchestratorError {
    fn from(err: envy::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
