//! Task model shared by the store, the scheduler and the workflows.

mod sql_type;
mod task;

use serde::{Deserialize, Serialize};

pub use sql_type::{pass_rate, round, SqlType};
pub use task::{
    ActionKind, AuditStatus, ExecStatus, ExecuteSql, RollbackSql, SqlSource, Task, TaskId,
    TaskStatus,
};

/// A managed database instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    /// Selects the driver backend.
    pub db_type: String,
    pub host: String,
    pub port: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// Field addressed by `TaskStore::update_task_fields`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskField {
    SqlType(SqlType),
    PassRate(f64),
    Status(TaskStatus),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn instance() -> Instance {
        Instance {
            id: 1,
            name: "inst_1".to_string(),
            db_type: "memory".to_string(),
            host: "127.0.0.1".to_string(),
            port: "3306".to_string(),
            user: "root".to_string(),
            password: "secret".to_string(),
        }
    }

    /// An initialized task holding `sqls`, numbered from 1.
    pub fn task_with(sqls: &[&str]) -> Task {
        Task {
            id: 1,
            instance: instance(),
            schema: "app".to_string(),
            sql_source: SqlSource::Form,
            sql_type: None,
            pass_rate: 0.0,
            status: TaskStatus::Initialized,
            execute_sqls: sqls
                .iter()
                .enumerate()
                .map(|(i, sql)| ExecuteSql::new(1, i as u32 + 1, *sql))
                .collect(),
            rollback_sqls: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }
}
