use std::ops::Range;

use sqlgate_driver::Driver;

use super::{mark_failed, mark_succeeded, parse_sqls, Workflows};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ExecStatus, ExecuteSql, SqlType, Task, TaskField, TaskId, TaskStatus};
use crate::result_ext::ResultExt;

impl Workflows {
    pub async fn commit(&self, task: &mut Task) -> OrchestratorResult<()> {
        tracing::info!(task_id = task.id, sql_type = ?task.sql_type, "Start commit");

        let session = self.drivers.open(&task.instance, &task.schema).await?;
        let result = self.run_commit(&*session, task).await;
        session.close_logged(task.id).await;

        match &result {
            Ok(()) => tracing::info!(task_id = task.id, status = %task.status, "Commit finished"),
            Err(e) => tracing::error!(task_id = task.id, error = %e, "Commit failed"),
        }
        result
    }

    async fn run_commit(&self, driver: &dyn Driver, task: &mut Task) -> OrchestratorResult<()> {
        let sql_type = match task.sql_type {
            Some(sql_type) if sql_type.executable().is_ok() => sql_type,
            _ => self.classify_for_commit(driver, task).await?,
        };

        match sql_type {
            SqlType::Dml => self.commit_dml(driver, task).await,
            SqlType::Ddl => self.commit_ddl(driver, task, false).await,
            SqlType::ProcedureFunction => self.commit_ddl(driver, task, true).await,
            SqlType::Multi => Err(OrchestratorError::SqlTypeConflict),
            SqlType::ProcedureFunctionMulti => Err(OrchestratorError::ProcedureFunctionConflict),
        }
    }

    /// Classify an unaudited or mixed task from its parsed statements.
    /// Conflicting types are rejected before anything is executed.
    async fn classify_for_commit(&self, driver: &dyn Driver, task: &mut Task) -> OrchestratorResult<SqlType> {
        parse_sqls(driver, &mut task.execute_sqls).await?;
        let sql_type = SqlType::classify_sqls(&task.execute_sqls)
            .ok_or_else(|| OrchestratorError::Validation("task has no statements".to_string()))?
            .executable()?;

        if task.sql_type != Some(sql_type) {
            self.store
                .update_task_fields(task.id, &[TaskField::SqlType(sql_type)])
                .await
                .log_task(task.id, "save task sql type")?;
            task.sql_type = Some(sql_type);
        }
        Ok(sql_type)
    }

    /// Run statements one by one, stopping at the first failure.
    async fn commit_ddl(&self, driver: &dyn Driver, task: &mut Task, routine: bool) -> OrchestratorResult<()> {
        let task_id = task.id;

        self.store
            .update_task_status(task_id, TaskStatus::Executing)
            .await
            .log_task(task_id, "mark task executing")?;
        task.status = TaskStatus::Executing;

        let outcome = self.execute_one_by_one(driver, task, routine).await;

        let status = if outcome.is_err() {
            TaskStatus::ExecFailed
        } else {
            task.executed_status()
        };
        self.store
            .update_task_status(task_id, status)
            .await
            .log_task(task_id, "save task status")?;
        task.status = status;

        outcome
    }

    async fn execute_one_by_one(&self, driver: &dyn Driver, task: &mut Task, routine: bool) -> OrchestratorResult<()> {
        let task_id = task.id;

        for sql in task.execute_sqls.iter_mut() {
            self.store
                .update_execute_sql_status(task_id, sql.number, ExecStatus::Doing, "")
                .await
                .log_task(task_id, "mark statement in progress")?;
            sql.exec_status = ExecStatus::Doing;
            sql.exec_result.clear();

            if routine {
                backup_routine(driver, task_id, sql).await;
            }

            match driver.exec(&sql.content).await {
                Ok(response) => {
                    tracing::debug!(task_id, number = sql.number, rows_affected = response.rows_affected, "Statement executed");
                    mark_succeeded(sql);
                }
                Err(e) => mark_failed(sql, e.to_string()),
            }

            self.store
                .save_execute_sql(sql)
                .await
                .log_task(task_id, "save executed statement")?;

            if sql.exec_status == ExecStatus::Failed {
                tracing::warn!(task_id, number = sql.number, error = %sql.exec_result, "Statement failed, stopping");
                break;
            }
        }
        Ok(())
    }

    /// Run the whole batch in one backend transaction.
    async fn commit_dml(&self, driver: &dyn Driver, task: &mut Task) -> OrchestratorResult<()> {
        let task_id = task.id;

        self.store
            .update_execute_sql_status_by_task(task_id, ExecStatus::Doing)
            .await
            .log_task(task_id, "mark statements in progress")?;
        for sql in task.execute_sqls.iter_mut() {
            sql.exec_status = ExecStatus::Doing;
        }

        parse_sqls(driver, &mut task.execute_sqls).await?;

        self.store
            .update_task_status(task_id, TaskStatus::Executing)
            .await
            .log_task(task_id, "mark task executing")?;
        task.status = TaskStatus::Executing;

        let (queries, spans) = tx_queries(&task.execute_sqls);
        match driver.tx(&queries).await {
            Ok(outcomes) => {
                if outcomes.len() != queries.len() {
                    tracing::warn!(
                        task_id,
                        expected = queries.len(),
                        received = outcomes.len(),
                        "Transaction returned a mismatched number of results"
                    );
                }
                for (sql, span) in task.execute_sqls.iter_mut().zip(spans) {
                    let failure = span.into_iter().find_map(|i| match outcomes.get(i) {
                        Some(outcome) => outcome.error.clone(),
                        None => Some("no result returned for statement".to_string()),
                    });
                    match failure {
                        Some(error) => mark_failed(sql, error),
                        None => mark_succeeded(sql),
                    }
                }
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "Transaction failed");
                for sql in task.execute_sqls.iter_mut() {
                    mark_failed(sql, e.to_string());
                }
            }
        }

        if let Err(e) = self
            .store
            .update_execute_sqls(task_id, &task.execute_sqls)
            .await
            .log_task(task_id, "save executed statements")
        {
            self.store
                .update_task_status(task_id, TaskStatus::ExecFailed)
                .await
                .log_task(task_id, "save task status")
                .ok();
            task.status = TaskStatus::ExecFailed;
            return Err(e);
        }

        let status = task.executed_status();
        self.store
            .update_task_status(task_id, status)
            .await
            .log_task(task_id, "save task status")?;
        task.status = status;
        Ok(())
    }
}

/// Flatten statements into transaction queries, remembering which queries
/// belong to which statement.
fn tx_queries(sqls: &[ExecuteSql]) -> (Vec<String>, Vec<Range<usize>>) {
    let mut queries = Vec::with_capacity(sqls.len());
    let mut spans = Vec::with_capacity(sqls.len());
    for sql in sqls {
        let start = queries.len();
        if sql.nodes.is_empty() {
            queries.push(sql.content.clone());
        } else {
            queries.extend(sql.nodes.iter().map(|n| n.text.clone()));
        }
        spans.push(start..queries.len());
    }
    (queries, spans)
}

/// Save the current routine definition before it is replaced.
/// Failures are logged and do not stop the commit.
async fn backup_routine(driver: &dyn Driver, task_id: TaskId, sql: &ExecuteSql) {
    let backup = match driver.gen_rollback_sql(&sql.content).await {
        Ok(backup) => backup,
        Err(e) => {
            tracing::error!(task_id, number = sql.number, error = %e, "Failed to get procedure/function backup");
            return;
        }
    };

    if backup.is_empty() {
        tracing::debug!(task_id, number = sql.number, reason = %backup.reason, "No procedure/function backup");
        return;
    }

    match driver.exec(&backup.sql).await {
        Ok(_) => tracing::info!(task_id, number = sql.number, "Procedure/function backup created"),
        Err(e) => tracing::error!(task_id, number = sql.number, error = %e, "Failed to create procedure/function backup"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::model::testing::task_with;

    fn audited(sqls: &[&str], sql_type: SqlType) -> Task {
        let mut task = task_with(sqls);
        task.status = TaskStatus::Audited;
        task.sql_type = Some(sql_type);
        task
    }

    #[tokio::test]
    async fn test_dml_commit_succeeds() {
        let harness = Harness::new().await;
        let id = harness
            .insert(audited(&["INSERT INTO t VALUES (1)", "UPDATE t SET a = 2 WHERE id = 1"], SqlType::Dml))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::ExecSucceeded);
        assert!(stored.execute_sqls.iter().all(|s| s.exec_status == ExecStatus::Succeeded));
        assert_eq!(stored.execute_sqls[0].exec_result, "ok");
        assert_eq!(harness.driver.call_count("tx"), 1);
        assert_eq!(harness.driver.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_dml_commit_records_failed_statement() {
        let harness = Harness::new().await;
        harness.driver.fail_on("INSERT INTO t VALUES (2)", "duplicate key");
        let id = harness
            .insert(audited(
                &[
                    "INSERT INTO t VALUES (1)",
                    "INSERT INTO t VALUES (2)",
                    "INSERT INTO t VALUES (3)",
                ],
                SqlType::Dml,
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::ExecFailed);
        assert_eq!(stored.execute_sqls[1].exec_status, ExecStatus::Failed);
        assert_eq!(stored.execute_sqls[1].exec_result, "duplicate key");
        assert_eq!(stored.execute_sqls[0].content, "INSERT INTO t VALUES (1)");
        assert_eq!(stored.execute_sqls[2].content, "INSERT INTO t VALUES (3)");
        assert_eq!(stored.execute_sqls[0].exec_status, ExecStatus::Succeeded);
        assert_eq!(stored.execute_sqls[2].exec_status, ExecStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dml_transaction_error_fails_every_statement() {
        let harness = Harness::new().await;
        harness.driver.fail_tx("connection reset");
        let id = harness
            .insert(audited(&["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"], SqlType::Dml))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::ExecFailed);
        assert!(stored
            .execute_sqls
            .iter()
            .all(|s| s.exec_status == ExecStatus::Failed && s.exec_result.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_multi_statement_entry_is_mapped_back() {
        let harness = Harness::new().await;
        harness.driver.fail_on("INSERT INTO t VALUES (2)", "duplicate key");
        let id = harness
            .insert(audited(
                &["INSERT INTO t VALUES (1); INSERT INTO t VALUES (2)", "INSERT INTO t VALUES (3)"],
                SqlType::Dml,
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.execute_sqls[0].exec_status, ExecStatus::Failed);
        assert_eq!(stored.execute_sqls[1].exec_status, ExecStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_ddl_commit_stops_at_first_failure() {
        let harness = Harness::new().await;
        harness.driver.fail_on("ALTER TABLE t ADD b int", "duplicate column");
        let id = harness
            .insert(audited(
                &["ALTER TABLE t ADD a int", "ALTER TABLE t ADD b int", "ALTER TABLE t ADD c int"],
                SqlType::Ddl,
            ))
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::ExecFailed);
        assert_eq!(stored.execute_sqls[0].exec_status, ExecStatus::Succeeded);
        assert_eq!(stored.execute_sqls[1].exec_status, ExecStatus::Failed);
        assert_eq!(stored.execute_sqls[2].exec_status, ExecStatus::Initialized);
        assert_eq!(harness.driver.call_count("exec"), 2);
        assert_eq!(harness.driver.executed(), vec!["ALTER TABLE t ADD a int"]);
    }

    #[tokio::test]
    async fn test_mixed_batch_is_rejected_before_execution() {
        let harness = Harness::new().await;
        let mut task = task_with(&["CREATE TABLE t(id int)", "INSERT INTO t VALUES (1)"]);
        task.status = TaskStatus::Audited;
        task.sql_type = Some(SqlType::Multi);
        let id = harness.insert(task).await;

        let mut task = harness.load(id).await;
        let err = harness.workflows.commit(&mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::SqlTypeConflict));
        assert_eq!(harness.driver.call_count("exec"), 0);
        assert_eq!(harness.driver.call_count("tx"), 0);
        assert_eq!(harness.driver.call_count("close"), 1);
        assert_eq!(harness.load(id).await.status, TaskStatus::Audited);
    }

    #[tokio::test]
    async fn test_stale_sql_type_is_reclassified() {
        let harness = Harness::new().await;
        let mut task = task_with(&["CREATE TABLE t(id int PRIMARY KEY)"]);
        task.sql_type = Some(SqlType::ProcedureFunctionMulti);
        task.status = TaskStatus::Audited;
        let id = harness.insert(task).await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.sql_type, Some(SqlType::Ddl));
        assert_eq!(stored.status, TaskStatus::ExecSucceeded);
    }

    #[tokio::test]
    async fn test_routine_commit_takes_backup_first() {
        let harness = Harness::new().await;
        let routine = "CREATE PROCEDURE p() BEGIN SELECT 1; END";
        harness
            .driver
            .set_rollback(routine, "CREATE PROCEDURE p_bak() BEGIN SELECT 0; END");
        let id = harness.insert(audited(&[routine], SqlType::ProcedureFunction)).await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        assert_eq!(
            harness.driver.executed(),
            vec!["CREATE PROCEDURE p_bak() BEGIN SELECT 0; END", routine]
        );
        assert_eq!(harness.load(id).await.status, TaskStatus::ExecSucceeded);
    }

    #[tokio::test]
    async fn test_routine_backup_failure_does_not_stop_commit() {
        let harness = Harness::new().await;
        let routine = "CREATE FUNCTION f() RETURNS int BEGIN RETURN 1; END";
        harness.driver.set_rollback(routine, "CREATE FUNCTION f_bak() RETURNS int BEGIN RETURN 0; END");
        harness
            .driver
            .fail_on("CREATE FUNCTION f_bak() RETURNS int BEGIN RETURN 0; END", "denied");
        let id = harness.insert(audited(&[routine], SqlType::ProcedureFunction)).await;

        let mut task = harness.load(id).await;
        harness.workflows.commit(&mut task).await.unwrap();

        assert_eq!(harness.driver.executed(), vec![routine]);
        assert_eq!(harness.load(id).await.status, TaskStatus::ExecSucceeded);
    }

    #[test]
    fn test_tx_queries_without_nodes() {
        let sqls = task_with(&["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]).execute_sqls;
        let (queries, spans) = tx_queries(&sqls);
        assert_eq!(queries.len(), 2);
        assert_eq!(spans, vec![0..1, 1..2]);
    }
}
