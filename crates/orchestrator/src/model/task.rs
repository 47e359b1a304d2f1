//! Task, statement and status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlgate_driver::protocol::{Node, RuleLevel};

use super::{Instance, SqlType};
use crate::error::{OrchestratorError, OrchestratorResult};

pub type TaskId = i64;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Unknown {}: {}", stringify!($name), s)),
                }
            }
        }
    };
}
pub(crate) use string_enum;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "initialized")]
    Initialized,
    #[serde(rename = "audited")]
    Audited,
    #[serde(rename = "executing")]
    Executing,
    #[serde(rename = "exec_success")]
    ExecSucceeded,
    #[serde(rename = "exec_failed")]
    ExecFailed,
}

string_enum!(TaskStatus {
    Initialized => "initialized",
    Audited => "audited",
    Executing => "executing",
    ExecSucceeded => "exec_success",
    ExecFailed => "exec_failed",
});

/// Audit progress of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[default]
    Initialized,
    Doing,
    Finished,
}

string_enum!(AuditStatus {
    Initialized => "initialized",
    Doing => "doing",
    Finished => "finished",
});

/// Execution progress of one statement (execute or rollback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    #[default]
    Initialized,
    Doing,
    Succeeded,
    Failed,
}

string_enum!(ExecStatus {
    Initialized => "initialized",
    Doing => "doing",
    Succeeded => "succeeded",
    Failed => "failed",
});

/// Where the task's SQL text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    #[default]
    Form,
    SqlFile,
    /// Statements extracted from MyBatis mapper files; rollback is not synthesized.
    MybatisXmlFile,
}

string_enum!(SqlSource {
    Form => "form",
    SqlFile => "sql_file",
    MybatisXmlFile => "mybatis_xml_file",
});

impl SqlSource {
    pub fn generates_rollback(&self) -> bool {
        !matches!(self, SqlSource::MybatisXmlFile)
    }
}

/// The three scheduler actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Audit,
    Commit,
    Rollback,
}

string_enum!(ActionKind {
    Audit => "audit",
    Commit => "commit",
    Rollback => "rollback",
});

/// One statement of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteSql {
    pub task_id: TaskId,
    /// 1-based position in the task.
    pub number: u32,
    pub content: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub audit_status: AuditStatus,
    #[serde(default)]
    pub audit_level: Option<RuleLevel>,
    #[serde(default)]
    pub audit_result: String,
    #[serde(default)]
    pub exec_status: ExecStatus,
    #[serde(default)]
    pub exec_result: String,
    /// Parsed statements, only held while a workflow runs.
    #[serde(skip)]
    pub nodes: Vec<Node>,
}

impl ExecuteSql {
    pub fn new(task_id: TaskId, number: u32, content: impl Into<String>) -> Self {
        Self {
            task_id,
            number,
            content: content.into(),
            fingerprint: String::new(),
            audit_status: AuditStatus::Initialized,
            audit_level: None,
            audit_result: String::new(),
            exec_status: ExecStatus::Initialized,
            exec_result: String::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }
}

/// Compensating statement for the execute statement with the same number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSql {
    pub task_id: TaskId,
    pub number: u32,
    /// Empty when no safe rollback exists.
    pub content: String,
    /// Why `content` is empty, as reported by the backend.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exec_status: ExecStatus,
    #[serde(default)]
    pub exec_result: String,
}

impl RollbackSql {
    pub fn new(task_id: TaskId, number: u32, content: impl Into<String>) -> Self {
        Self {
            task_id,
            number,
            content: content.into(),
            description: String::new(),
            exec_status: ExecStatus::Initialized,
            exec_result: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// A batch of SQL changes tracked through audit, commit and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instance: Instance,
    /// Schema the statements run against.
    pub schema: String,
    #[serde(default)]
    pub sql_source: SqlSource,
    pub sql_type: Option<SqlType>,
    pub pass_rate: f64,
    pub status: TaskStatus,
    pub execute_sqls: Vec<ExecuteSql>,
    pub rollback_sqls: Vec<RollbackSql>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Check the requested action against the current status.
    pub fn valid_action(&self, action: ActionKind) -> OrchestratorResult<()> {
        let refuse = |reason: &str| -> OrchestratorResult<()> {
            Err(OrchestratorError::ActionNotAllowed {
                task_id: self.id,
                action,
                status: self.status,
                reason: reason.to_string(),
            })
        };

        match action {
            ActionKind::Audit => match self.status {
                TaskStatus::Initialized | TaskStatus::Audited => Ok(()),
                _ => refuse("task has already been executed"),
            },
            ActionKind::Commit => match self.status {
                TaskStatus::Audited => Ok(()),
                TaskStatus::Initialized if self.sql_type.is_some() => Ok(()),
                TaskStatus::Initialized => refuse("task has not been audited"),
                _ => refuse("task has already been executed"),
            },
            ActionKind::Rollback => match self.status {
                TaskStatus::ExecSucceeded | TaskStatus::ExecFailed => {
                    if self.rollback_sqls.iter().any(|r| !r.is_empty()) {
                        Ok(())
                    } else {
                        refuse("task has no rollback statements")
                    }
                }
                _ => refuse("task has not been executed"),
            },
        }
    }

    /// Statements in ascending sequence order.
    pub fn sort_sqls(&mut self) {
        self.execute_sqls.sort_by_key(|s| s.number);
        self.rollback_sqls.sort_by_key(|s| s.number);
    }

    pub fn has_failed_statement(&self) -> bool {
        self.execute_sqls
            .iter()
            .any(|s| s.exec_status == ExecStatus::Failed)
    }

    /// Final status after a commit.
    pub fn executed_status(&self) -> TaskStatus {
        if self.has_failed_statement() {
            TaskStatus::ExecFailed
        } else {
            TaskStatus::ExecSucceeded
        }
    }
}
