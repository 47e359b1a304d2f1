//! Durable record of tasks and their statements.
//!
//! Workflows only talk to the [`TaskStore`] trait. [`MemoryTaskStore`] keeps
//! everything in process; [`PgTaskStore`] persists to PostgreSQL.

mod memory;
mod pool;
mod postgres;

use async_trait::async_trait;
use sqlgate_driver::protocol::Rule;

use crate::error::OrchestratorResult;
use crate::model::{
    ExecStatus, ExecuteSql, Instance, RollbackSql, SqlSource, Task, TaskField, TaskId, TaskStatus,
};

pub use memory::MemoryTaskStore;
pub use pool::{create_pool, health_check, DbPool};
pub use postgres::PgTaskStore;

/// Input of `TaskStore::create_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub instance_id: i64,
    pub schema: String,
    pub sql_source: SqlSource,
    /// `task_id` of each statement is ignored and assigned by the store.
    pub execute_sqls: Vec<ExecuteSql>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load a task with its instance and statements, ordered by number.
    async fn task(&self, id: TaskId) -> OrchestratorResult<Option<Task>>;

    /// Audit rules bound to an instance.
    async fn rules_by_instance(&self, instance_id: i64) -> OrchestratorResult<Vec<Rule>>;

    /// Audited, fully passing DDL tasks on the same instance and schema.
    async fn related_ddl_tasks(&self, task: &Task) -> OrchestratorResult<Vec<Task>>;

    /// Persist audit and execution fields of every statement.
    async fn update_execute_sqls(&self, task_id: TaskId, sqls: &[ExecuteSql])
        -> OrchestratorResult<()>;

    /// Replace the rollback statements of a task.
    async fn update_rollback_sqls(
        &self,
        task_id: TaskId,
        sqls: &[RollbackSql],
    ) -> OrchestratorResult<()>;

    /// Update the given task fields together.
    async fn update_task_fields(&self, task_id: TaskId, fields: &[TaskField])
        -> OrchestratorResult<()>;

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus)
        -> OrchestratorResult<()>;

    async fn update_execute_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()>;

    async fn update_rollback_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()>;

    /// Save one statement record as is.
    async fn save_execute_sql(&self, sql: &ExecuteSql) -> OrchestratorResult<()>;

    async fn save_rollback_sql(&self, sql: &RollbackSql) -> OrchestratorResult<()>;

    /// Set the execution status of every statement of a task.
    async fn update_execute_sql_status_by_task(
        &self,
        task_id: TaskId,
        status: ExecStatus,
    ) -> OrchestratorResult<()>;

    async fn create_task(&self, task: NewTask) -> OrchestratorResult<Task>;

    async fn instance_by_name(&self, name: &str) -> OrchestratorResult<Option<Instance>>;

    /// Whether the backing storage is reachable.
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Whether `candidate` can supply schema context for a DML audit of `task`.
pub(crate) fn is_related_ddl(task: &Task, candidate: &Task) -> bool {
    candidate.id != task.id
        && candidate.instance.id == task.instance.id
        && candidate.schema == task.schema
        && candidate.sql_type == Some(crate::model::SqlType::Ddl)
        && candidate.status == TaskStatus::Audited
        && candidate.pass_rate == 1.0
}
