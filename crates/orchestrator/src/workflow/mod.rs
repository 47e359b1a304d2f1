//! Audit, commit and rollback workflows.
//!
//! Each workflow opens one driver session for the task's instance, runs a
//! fixed sequence of driver calls interleaved with store updates, and closes
//! the session on every exit path. Statements are always processed in
//! ascending sequence order.

mod audit;
mod commit;
mod rollback;

use std::sync::Arc;

use async_trait::async_trait;
use sqlgate_driver::protocol::{AuditRequest, AuditResult};
use sqlgate_driver::{Driver, DriverError};

use crate::drivers::DriverRegistry;
use crate::error::OrchestratorResult;
use crate::model::{ActionKind, ExecStatus, ExecuteSql, Task};
use crate::scheduler::ActionHandler;
use crate::store::TaskStore;

/// Execution result recorded for a successful statement.
pub const EXEC_RESULT_OK: &str = "ok";

/// The three task workflows.
#[derive(Clone)]
pub struct Workflows {
    store: Arc<dyn TaskStore>,
    drivers: DriverRegistry,
}

impl Workflows {
    pub fn new(store: Arc<dyn TaskStore>, drivers: DriverRegistry) -> Self {
        Self { store, drivers }
    }
}

#[async_trait]
impl ActionHandler for Workflows {
    async fn handle(&self, action: ActionKind, task: &mut Task) -> OrchestratorResult<()> {
        task.sort_sqls();
        match action {
            ActionKind::Audit => self.audit(task).await,
            ActionKind::Commit => self.commit(task).await,
            ActionKind::Rollback => self.rollback(task).await,
        }
    }
}

/// Parse every statement, keeping the nodes and filling in missing fingerprints.
async fn parse_sqls(driver: &dyn Driver, sqls: &mut [ExecuteSql]) -> OrchestratorResult<()> {
    for sql in sqls.iter_mut() {
        let nodes = driver.parse(&sql.content).await?;
        if sql.fingerprint.is_empty() {
            sql.fingerprint = nodes
                .iter()
                .map(|n| n.fingerprint.as_str())
                .collect::<Vec<_>>()
                .join("; ");
        }
        sql.nodes = nodes;
    }
    Ok(())
}

/// Run `Audit`, checking the reply is aligned with the request.
async fn audit_sqls(driver: &dyn Driver, request: &AuditRequest) -> OrchestratorResult<Vec<AuditResult>> {
    let results = driver.audit(request.clone()).await?;
    if results.len() != request.sqls.len() {
        return Err(DriverError::Protocol(format!(
            "audit returned {} results for {} statements",
            results.len(),
            request.sqls.len()
        ))
        .into());
    }
    Ok(results)
}

fn mark_succeeded(sql: &mut ExecuteSql) {
    sql.exec_status = ExecStatus::Succeeded;
    sql.exec_result = EXEC_RESULT_OK.to_string();
}

fn mark_failed(sql: &mut ExecuteSql, error: impl Into<String>) {
    sql.exec_status = ExecStatus::Failed;
    sql.exec_result = error.into();
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::Harness;
    use super::*;
    use crate::model::{TaskId, TaskStatus};
    use crate::scheduler::Scheduler;

    fn numbers(task: &Task) -> (Vec<u32>, Vec<u32>) {
        (
            task.execute_sqls.iter().map(|s| s.number).collect(),
            task.rollback_sqls.iter().map(|r| r.number).collect(),
        )
    }

    async fn run(scheduler: &Scheduler, id: TaskId, action: ActionKind) -> Task {
        scheduler
            .enqueue_and_wait(id, action)
            .await
            .unwrap()
            .into_result()
            .unwrap()
    }

    #[tokio::test]
    async fn test_audit_commit_rollback_keep_statement_order() {
        let harness = Harness::new().await;
        let statements = [
            ("INSERT INTO t VALUES (1)", "DELETE FROM t WHERE id = 1"),
            ("UPDATE t SET a = 2 WHERE id = 1", "UPDATE t SET a = 1 WHERE id = 1"),
            ("DELETE FROM t WHERE id = 3", "INSERT INTO t VALUES (3)"),
        ];
        for (sql, rollback) in statements {
            harness.driver.set_rollback(sql, rollback);
        }
        let id = harness
            .add_task(&statements.map(|(sql, _)| sql))
            .await;

        let scheduler = Scheduler::new(
            harness.store.clone(),
            Arc::new(harness.workflows.clone()),
            16,
            Duration::from_secs(1),
        );
        scheduler.start().unwrap();

        let audited = run(&scheduler, id, ActionKind::Audit).await;
        assert_eq!(audited.status, TaskStatus::Audited);
        assert_eq!(numbers(&audited), (vec![1, 2, 3], vec![1, 2, 3]));
        for (sql, rollback) in audited.execute_sqls.iter().zip(&audited.rollback_sqls) {
            let expected = statements[sql.number as usize - 1];
            assert_eq!(sql.content, expected.0);
            assert_eq!(rollback.content, expected.1);
        }

        let committed = run(&scheduler, id, ActionKind::Commit).await;
        assert_eq!(committed.status, TaskStatus::ExecSucceeded);
        assert_eq!(numbers(&committed), (vec![1, 2, 3], vec![1, 2, 3]));
        assert!(committed
            .execute_sqls
            .iter()
            .all(|s| s.exec_status == ExecStatus::Succeeded));

        let rolled_back = run(&scheduler, id, ActionKind::Rollback).await;
        assert_eq!(numbers(&rolled_back), (vec![1, 2, 3], vec![1, 2, 3]));
        assert!(rolled_back
            .rollback_sqls
            .iter()
            .all(|r| r.exec_status == ExecStatus::Succeeded));

        let mut expected: Vec<String> = statements.iter().map(|(sql, _)| sql.to_string()).collect();
        expected.extend(statements.iter().map(|(_, rollback)| rollback.to_string()));
        assert_eq!(harness.driver.executed(), expected);

        scheduler.stop().await;
    }
}
