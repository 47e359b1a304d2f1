use sqlgate_driver::Driver;

use super::{parse_sqls, Workflows, EXEC_RESULT_OK};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ExecStatus, SqlType, Task, TaskId};
use crate::result_ext::ResultExt;

/// Whether a task of `sql_type` has rollback statements to run.
fn should_roll_back(task_id: TaskId, sql_type: SqlType) -> OrchestratorResult<bool> {
    match sql_type {
        SqlType::Dml | SqlType::Ddl => Ok(true),
        SqlType::ProcedureFunction => {
            tracing::info!(task_id, "Procedure and function tasks are not rolled back");
            Ok(false)
        }
        SqlType::Multi => Err(OrchestratorError::SqlTypeConflict),
        SqlType::ProcedureFunctionMulti => Err(OrchestratorError::ProcedureFunctionConflict),
    }
}

impl Workflows {
    pub async fn rollback(&self, task: &mut Task) -> OrchestratorResult<()> {
        tracing::info!(task_id = task.id, sql_type = ?task.sql_type, "Start rollback");

        if let Some(sql_type) = task.sql_type {
            if !should_roll_back(task.id, sql_type).log_task(task.id, "check rollback type")? {
                return Ok(());
            }
        }

        let session = self.drivers.open(&task.instance, &task.schema).await?;
        let result = self.run_rollback(&*session, task).await;
        session.close_logged(task.id).await;

        match &result {
            Ok(()) => tracing::info!(task_id = task.id, "Rollback finished"),
            Err(e) => tracing::error!(task_id = task.id, error = %e, "Rollback failed"),
        }
        result
    }

    async fn run_rollback(&self, driver: &dyn Driver, task: &mut Task) -> OrchestratorResult<()> {
        let task_id = task.id;

        if task.sql_type.is_none() {
            parse_sqls(driver, &mut task.execute_sqls).await?;
            let sql_type = SqlType::classify_sqls(&task.execute_sqls)
                .ok_or_else(|| OrchestratorError::Validation("task has no statements".to_string()))?;
            if !should_roll_back(task_id, sql_type)? {
                return Ok(());
            }
        }

        for rollback in task.rollback_sqls.iter_mut().filter(|r| !r.is_empty()) {
            self.store
                .update_rollback_sql_status(task_id, rollback.number, ExecStatus::Doing, "")
                .await
                .log_task(task_id, "mark rollback statement in progress")?;
            rollback.exec_status = ExecStatus::Doing;

            let outcome = driver.exec(&rollback.content).await;
            match &outcome {
                Ok(_) => {
                    rollback.exec_status = ExecStatus::Succeeded;
                    rollback.exec_result = EXEC_RESULT_OK.to_string();
                }
                Err(e) => {
                    rollback.exec_status = ExecStatus::Failed;
                    rollback.exec_result = e.to_string();
                }
            }

            self.store
                .save_rollback_sql(rollback)
                .await
                .log_task(task_id, "save rollback statement")?;

            if let Err(e) = outcome {
                tracing::warn!(task_id, number = rollback.number, error = %e, "Rollback statement failed, stopping");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::model::testing::task_with;
    use crate::model::{RollbackSql, TaskStatus};
    use sqlgate_driver::DriverError;

    fn executed(sqls: &[&str], rollbacks: &[&str], sql_type: Option<SqlType>) -> Task {
        let mut task = task_with(sqls);
        task.status = TaskStatus::ExecSucceeded;
        task.sql_type = sql_type;
        task.rollback_sqls = rollbacks
            .iter()
            .enumerate()
            .map(|(i, sql)| RollbackSql::new(1, i as u32 + 1, *sql))
            .collect();
        task
    }

    #[tokio::test]
    async fn test_rollback_runs_in_order() {
        let harness = Harness::new().await;
        let id = harness
            .insert(executed(
                &["CREATE TABLE a(id int)", "CREATE TABLE b(id int)"],
                &["DROP TABLE a", "DROP TABLE b"],
                Some(SqlType::Ddl),
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.rollback(&mut task).await.unwrap();

        assert_eq!(harness.driver.executed(), vec!["DROP TABLE a", "DROP TABLE b"]);
        let stored = harness.load(id).await;
        assert!(stored.rollback_sqls.iter().all(|r| r.exec_status == ExecStatus::Succeeded));
        assert_eq!(stored.rollback_sqls[0].exec_result, "ok");
    }

    #[tokio::test]
    async fn test_empty_entries_are_skipped() {
        let harness = Harness::new().await;
        let id = harness
            .insert(executed(
                &["DELETE FROM t WHERE id=1", "UPDATE t SET a = 1 WHERE id = 2"],
                &["INSERT INTO t (id) VALUES (1)", ""],
                Some(SqlType::Dml),
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.rollback(&mut task).await.unwrap();

        assert_eq!(harness.driver.call_count("exec"), 1);
        let stored = harness.load(id).await;
        assert_eq!(stored.rollback_sqls[1].exec_status, ExecStatus::Initialized);
    }

    #[tokio::test]
    async fn test_rollback_stops_at_first_failure() {
        let harness = Harness::new().await;
        harness.driver.fail_on("DROP TABLE a", "table is locked");
        let id = harness
            .insert(executed(
                &["CREATE TABLE a(id int)", "CREATE TABLE b(id int)"],
                &["DROP TABLE a", "DROP TABLE b"],
                Some(SqlType::Ddl),
            ))
            .await;

        let mut task = harness.load(id).await;
        let err = harness.workflows.rollback(&mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Driver(DriverError::Execution(ref m)) if m == "table is locked"));
        assert_eq!(harness.driver.call_count("exec"), 1);
        assert_eq!(harness.driver.call_count("close"), 1);
        let stored = harness.load(id).await;
        assert_eq!(stored.rollback_sqls[0].exec_status, ExecStatus::Failed);
        assert_eq!(stored.rollback_sqls[1].exec_status, ExecStatus::Initialized);
    }

    #[tokio::test]
    async fn test_routine_task_is_not_rolled_back() {
        let harness = Harness::new().await;
        let id = harness
            .insert(executed(
                &["CREATE PROCEDURE p() BEGIN SELECT 1; END"],
                &["DROP PROCEDURE p"],
                Some(SqlType::ProcedureFunction),
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.rollback(&mut task).await.unwrap();

        assert_eq!(harness.driver.call_count("exec"), 0);
        assert!(harness.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_task_is_refused() {
        let harness = Harness::new().await;
        let id = harness
            .insert(executed(
                &["CREATE TABLE a(id int)", "INSERT INTO a VALUES (1)"],
                &["DROP TABLE a", ""],
                Some(SqlType::Multi),
            ))
            .await;

        let mut task = harness.load(id).await;
        let err = harness.workflows.rollback(&mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::SqlTypeConflict));
        assert_eq!(harness.driver.call_count("exec"), 0);
    }

    #[tokio::test]
    async fn test_untyped_task_is_classified_first() {
        let harness = Harness::new().await;
        let id = harness
            .insert(executed(
                &["CREATE FUNCTION f() RETURNS int BEGIN RETURN 1; END"],
                &["DROP FUNCTION f"],
                None,
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.rollback(&mut task).await.unwrap();

        assert_eq!(harness.driver.call_count("parse"), 1);
        assert_eq!(harness.driver.call_count("exec"), 0);
        assert_eq!(harness.driver.call_count("close"), 1);
    }
}
