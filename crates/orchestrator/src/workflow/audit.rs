use sqlgate_driver::protocol::{AuditRequest, AuditResult, Rule, RuleLevel};
use sqlgate_driver::Driver;

use super::{audit_sqls, parse_sqls, Workflows};
use crate::error::OrchestratorResult;
use crate::model::{pass_rate, AuditStatus, ExecuteSql, RollbackSql, SqlType, Task, TaskField, TaskStatus};
use crate::result_ext::ResultExt;

fn apply_audit(sqls: &mut [ExecuteSql], results: Vec<AuditResult>) {
    for (sql, result) in sqls.iter_mut().zip(results) {
        sql.audit_level = Some(result.level);
        sql.audit_result = result.message;
        sql.audit_status = AuditStatus::Finished;
    }
}

/// A batch is invalid as soon as one statement audits at `error`.
fn is_invalid(sqls: &[ExecuteSql]) -> bool {
    sqls.iter().any(|s| s.audit_level == Some(RuleLevel::Error))
}

impl Workflows {
    pub async fn audit(&self, task: &mut Task) -> OrchestratorResult<()> {
        tracing::info!(task_id = task.id, "Start audit");

        let rules = self
            .store
            .rules_by_instance(task.instance.id)
            .await
            .log_task(task.id, "load instance rules")?;

        let session = self.drivers.open(&task.instance, &task.schema).await?;
        let result = self.run_audit(&*session, task, rules).await;
        session.close_logged(task.id).await;

        match &result {
            Ok(()) => tracing::info!(task_id = task.id, pass_rate = task.pass_rate, "Audit finished"),
            Err(e) => tracing::error!(task_id = task.id, error = %e, "Audit failed"),
        }
        result
    }

    async fn run_audit(
        &self,
        driver: &dyn Driver,
        task: &mut Task,
        rules: Vec<Rule>,
    ) -> OrchestratorResult<()> {
        let task_id = task.id;

        parse_sqls(driver, &mut task.execute_sqls).await?;
        let sql_type = SqlType::classify_sqls(&task.execute_sqls);

        for sql in task.execute_sqls.iter_mut() {
            sql.audit_status = AuditStatus::Doing;
        }
        self.store
            .update_execute_sqls(task_id, &task.execute_sqls)
            .await
            .log_task(task_id, "mark statements auditing")?;

        let request = AuditRequest {
            rules,
            sqls: task.execute_sqls.iter().map(|s| s.content.clone()).collect(),
            schema: task.schema.clone(),
            context: Vec::new(),
        };
        let results = audit_sqls(driver, &request).await?;
        apply_audit(&mut task.execute_sqls, results);
        let first_invalid = is_invalid(&task.execute_sqls);

        // A DML batch may only fail because its tables are created by a
        // sibling DDL task that has not been executed yet.
        if sql_type == Some(SqlType::Dml) && first_invalid {
            let related = self
                .store
                .related_ddl_tasks(task)
                .await
                .log_task(task_id, "load related DDL tasks")?;

            if !related.is_empty() {
                tracing::warn!(
                    task_id,
                    related_tasks = related.len(),
                    "DML audit failed, retrying with related DDL"
                );
                let context = related
                    .iter()
                    .flat_map(|t| t.execute_sqls.iter().map(|s| s.content.clone()))
                    .collect();
                let retry = AuditRequest { context, ..request };
                let results = audit_sqls(driver, &retry).await?;
                apply_audit(&mut task.execute_sqls, results);
            }
        }

        let rollback_sqls = if first_invalid {
            tracing::warn!(task_id, "SQL invalid, skip generating rollback");
            Vec::new()
        } else if !task.sql_source.generates_rollback() {
            tracing::warn!(task_id, source = %task.sql_source, "Rollback is not generated for this SQL source");
            Vec::new()
        } else {
            generate_rollback(driver, task).await?
        };

        self.store
            .update_execute_sqls(task_id, &task.execute_sqls)
            .await
            .log_task(task_id, "save audited statements")?;

        if let Some(rate) = pass_rate(&task.execute_sqls) {
            task.pass_rate = rate;
        }
        task.status = TaskStatus::Audited;

        let mut fields = vec![
            TaskField::PassRate(task.pass_rate),
            TaskField::Status(task.status),
        ];
        if let Some(sql_type) = sql_type {
            task.sql_type = Some(sql_type);
            fields.insert(0, TaskField::SqlType(sql_type));
        }
        self.store
            .update_task_fields(task_id, &fields)
            .await
            .log_task(task_id, "save audited task")?;

        if !rollback_sqls.is_empty() {
            self.store
                .update_rollback_sqls(task_id, &rollback_sqls)
                .await
                .log_task(task_id, "save rollback statements")?;
            task.rollback_sqls = rollback_sqls;
        }
        Ok(())
    }
}

async fn generate_rollback(driver: &dyn Driver, task: &Task) -> OrchestratorResult<Vec<RollbackSql>> {
    let mut rollback_sqls = Vec::with_capacity(task.execute_sqls.len());
    for sql in &task.execute_sqls {
        let generated = driver.gen_rollback_sql(&sql.content).await?;
        if generated.is_empty() {
            tracing::debug!(task_id = task.id, number = sql.number, reason = %generated.reason, "No rollback statement");
        }
        let mut rollback = RollbackSql::new(task.id, sql.number, generated.sql);
        rollback.description = generated.reason;
        rollback_sqls.push(rollback);
    }
    Ok(rollback_sqls)
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use crate::error::OrchestratorError;
    use crate::model::testing::task_with;
    use crate::model::SqlSource;
    use sqlgate_driver::DriverError;

    #[tokio::test]
    async fn test_audit_single_delete() {
        let harness = Harness::new().await;
        harness
            .driver
            .set_rollback("DELETE FROM t WHERE id=1", "INSERT INTO t (id) VALUES (1)");
        let id = harness.add_task(&["DELETE FROM t WHERE id=1"]).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::Audited);
        assert_eq!(stored.pass_rate, 1.0);
        assert_eq!(stored.sql_type, Some(SqlType::Dml));
        assert_eq!(stored.execute_sqls[0].audit_level, Some(RuleLevel::Normal));
        assert_eq!(stored.execute_sqls[0].audit_status, AuditStatus::Finished);
        assert_eq!(stored.execute_sqls[0].fingerprint, "delete from t where id=?");
        assert_eq!(stored.rollback_sqls.len(), 1);
        assert_eq!(stored.rollback_sqls[0].content, "INSERT INTO t (id) VALUES (1)");
        assert_eq!(harness.driver.call_count("close"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_rollback_keeps_reason() {
        let harness = Harness::new().await;
        let id = harness.add_task(&["UPDATE t SET a = 1 WHERE id = 2"]).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.rollback_sqls.len(), 1);
        assert!(stored.rollback_sqls[0].is_empty());
        assert!(!stored.rollback_sqls[0].description.is_empty());
    }

    #[tokio::test]
    async fn test_pass_rate_is_stable_across_audits() {
        let harness = Harness::new().await;
        harness
            .driver
            .set_audit_level("INSERT INTO t VALUES (2)", RuleLevel::Warn, "duplicate index");
        let id = harness
            .add_task(&[
                "INSERT INTO t VALUES (1)",
                "INSERT INTO t VALUES (2)",
                "INSERT INTO t VALUES (3)",
            ])
            .await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();
        let first = harness.load(id).await.pass_rate;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();
        let second = harness.load(id).await.pass_rate;

        assert_eq!(first, 0.6667);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_batch_skips_rollback() {
        let harness = Harness::new().await;
        harness
            .driver
            .set_audit_level("DROP TABLE t", RuleLevel::Error, "drop is forbidden");
        let id = harness.add_task(&["DROP TABLE t"]).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.pass_rate, 0.0);
        assert!(stored.rollback_sqls.is_empty());
        assert_eq!(harness.driver.call_count("gen_rollback_sql"), 0);
    }

    #[tokio::test]
    async fn test_mybatis_source_skips_rollback() {
        let harness = Harness::new().await;
        let mut task = task_with(&["DELETE FROM t WHERE id=1"]);
        task.sql_source = SqlSource::MybatisXmlFile;
        let id = harness.insert(task).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        assert!(harness.load(id).await.rollback_sqls.is_empty());
        assert_eq!(harness.driver.call_count("gen_rollback_sql"), 0);
    }

    #[tokio::test]
    async fn test_dml_retry_with_related_ddl() {
        let harness = Harness::new().await;
        harness.driver.set_audit_level_without_context(
            "INSERT INTO t2 VALUES (1)",
            RuleLevel::Error,
            "table t2 does not exist",
            "CREATE TABLE t2",
        );

        let mut ddl = task_with(&["CREATE TABLE t2(id int)"]);
        ddl.sql_type = Some(SqlType::Ddl);
        ddl.status = TaskStatus::Audited;
        ddl.pass_rate = 1.0;
        harness.insert(ddl).await;

        let id = harness.add_task(&["INSERT INTO t2 VALUES (1)"]).await;
        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.execute_sqls[0].audit_level, Some(RuleLevel::Normal));
        assert_eq!(stored.pass_rate, 1.0);

        let requests = harness.driver.audit_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].context.is_empty());
        assert_eq!(requests[1].context, vec!["CREATE TABLE t2(id int)".to_string()]);
        // Rollback follows the first verdict.
        assert!(stored.rollback_sqls.is_empty());
    }

    #[tokio::test]
    async fn test_dml_without_related_ddl_is_not_retried() {
        let harness = Harness::new().await;
        harness.driver.set_audit_level(
            "INSERT INTO t2 VALUES (1)",
            RuleLevel::Error,
            "table t2 does not exist",
        );
        let id = harness.add_task(&["INSERT INTO t2 VALUES (1)"]).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        assert_eq!(harness.driver.audit_requests().len(), 1);
        assert_eq!(
            harness.load(id).await.execute_sqls[0].audit_level,
            Some(RuleLevel::Error)
        );
    }

    #[tokio::test]
    async fn test_rules_are_sent_to_driver() {
        let rules = vec![Rule {
            name: "dml_check_where_exist".to_string(),
            desc: "UPDATE/DELETE must have a WHERE clause".to_string(),
            value: String::new(),
            level: RuleLevel::Error,
            rule_type: "dml".to_string(),
            is_default: true,
        }];
        let harness = Harness::with_rules(rules).await;
        let id = harness.add_task(&["DELETE FROM t"]).await;

        let mut task = harness.load(id).await;
        harness.workflows.audit(&mut task).await.unwrap();

        let stored = harness.load(id).await;
        assert_eq!(stored.execute_sqls[0].audit_level, Some(RuleLevel::Error));
        assert!(stored.execute_sqls[0].audit_result.contains("WHERE"));
        assert_eq!(harness.driver.audit_requests()[0].rules.len(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_aborts_and_closes() {
        let harness = Harness::new().await;
        let id = harness.add_task(&["SHOW TABLES"]).await;

        let mut task = harness.load(id).await;
        let err = harness.workflows.audit(&mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Driver(DriverError::Parse(_))));
        assert_eq!(harness.load(id).await.status, TaskStatus::Initialized);
        assert_eq!(harness.driver.call_count("close"), 1);
    }

    #[tokio::test]
    async fn test_statements_stay_doing_when_audit_fails() {
        let harness = Harness::new().await;
        harness.driver.fail_audit("rule engine unavailable");
        let id = harness
            .add_task(&["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"])
            .await;

        let mut task = harness.load(id).await;
        let err = harness.workflows.audit(&mut task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Driver(DriverError::Execution(_))));

        let stored = harness.load(id).await;
        assert_eq!(stored.status, TaskStatus::Initialized);
        assert!(stored
            .execute_sqls
            .iter()
            .all(|s| s.audit_status == AuditStatus::Doing));
        assert_eq!(harness.driver.call_count("close"), 1);
    }
}

