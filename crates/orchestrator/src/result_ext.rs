//! Result extension trait for logging failures with task context.

use std::fmt::Display;

use crate::model::TaskId;

/// Extension trait for logging errors with context and call site.
pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use sqlgate_orchestrator::result_ext::ResultExt;
    ///
    /// let result: Result<i32, &str> = Err("something went wrong");
    /// let _ = result.log("processing request");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Like [`ResultExt::log`], tagged with the task the operation belongs to.
    fn log_task<S: ToString>(self, task_id: TaskId, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            tracing::error!(
                target: "sqlgate_orchestrator",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn log_task<S: ToString>(self, task_id: TaskId, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            tracing::error!(
                target: "sqlgate_orchestrator",
                task_id,
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}
