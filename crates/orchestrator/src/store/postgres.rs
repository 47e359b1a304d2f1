//! PostgreSQL task store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlgate_driver::protocol::{Rule, RuleLevel};
use sqlx::FromRow;

use super::pool::{health_check, DbPool};
use super::{NewTask, TaskStore};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    ExecStatus, ExecuteSql, Instance, RollbackSql, Task, TaskField, TaskId, TaskStatus,
};

const MIGRATION: &str = include_str!("../../migrations/0001_sqlgate.sql");

const TASK_SELECT: &str = r#"
    SELECT
        t.id, t.schema_name, t.sql_source, t.sql_type, t.pass_rate, t.status, t.created_at,
        i.id AS instance_id, i.name AS instance_name, i.db_type, i.host, i.port,
        i.db_user, i.db_password
    FROM sqlgate.task t
    JOIN sqlgate.instance i ON i.id = t.instance_id
"#;

fn parse_column<T>(column: &str, value: &str) -> OrchestratorResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| OrchestratorError::Storage(format!("invalid {}: {}", column, e)))
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: i64,
    name: String,
    db_type: String,
    host: String,
    port: String,
    db_user: String,
    db_password: String,
}

impl From<InstanceRow> for Instance {
    fn from(row: InstanceRow) -> Self {
        Instance {
            id: row.id,
            name: row.name,
            db_type: row.db_type,
            host: row.host,
            port: row.port,
            user: row.db_user,
            password: row.db_password,
        }
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    schema_name: String,
    sql_source: String,
    sql_type: Option<String>,
    pass_rate: f64,
    status: String,
    created_at: DateTime<Utc>,
    instance_id: i64,
    instance_name: String,
    db_type: String,
    host: String,
    port: String,
    db_user: String,
    db_password: String,
}

impl TaskRow {
    fn into_task(
        self,
        execute_sqls: Vec<ExecuteSql>,
        rollback_sqls: Vec<RollbackSql>,
    ) -> OrchestratorResult<Task> {
        Ok(Task {
            id: self.id,
            instance: Instance {
                id: self.instance_id,
                name: self.instance_name,
                db_type: self.db_type,
                host: self.host,
                port: self.port,
                user: self.db_user,
                password: self.db_password,
            },
            schema: self.schema_name,
            sql_source: parse_column("sql_source", &self.sql_source)?,
            sql_type: self
                .sql_type
                .as_deref()
                .map(|t| parse_column("sql_type", t))
                .transpose()?,
            pass_rate: self.pass_rate,
            status: parse_column("status", &self.status)?,
            execute_sqls,
            rollback_sqls,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecuteSqlRow {
    task_id: i64,
    number: i32,
    content: String,
    fingerprint: String,
    audit_status: String,
    audit_level: Option<String>,
    audit_result: String,
    exec_status: String,
    exec_result: String,
}

impl TryFrom<ExecuteSqlRow> for ExecuteSql {
    type Error = OrchestratorError;

    fn try_from(row: ExecuteSqlRow) -> Result<Self, Self::Error> {
        Ok(ExecuteSql {
            task_id: row.task_id,
            number: row.number as u32,
            content: row.content,
            fingerprint: row.fingerprint,
            audit_status: parse_column("audit_status", &row.audit_status)?,
            audit_level: row
                .audit_level
                .as_deref()
                .map(|l| parse_column::<RuleLevel>("audit_level", l))
                .transpose()?,
            audit_result: row.audit_result,
            exec_status: parse_column("exec_status", &row.exec_status)?,
            exec_result: row.exec_result,
            nodes: Vec::new(),
        })
    }
}

#[derive(Debug, FromRow)]
struct RollbackSqlRow {
    task_id: i64,
    number: i32,
    content: String,
    description: String,
    exec_status: String,
    exec_result: String,
}

impl TryFrom<RollbackSqlRow> for RollbackSql {
    type Error = OrchestratorError;

    fn try_from(row: RollbackSqlRow) -> Result<Self, Self::Error> {
        Ok(RollbackSql {
            task_id: row.task_id,
            number: row.number as u32,
            content: row.content,
            description: row.description,
            exec_status: parse_column("exec_status", &row.exec_status)?,
            exec_result: row.exec_result,
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    name: String,
    description: String,
    value: String,
    level: String,
    rule_type: String,
    is_default: bool,
}

impl TryFrom<RuleRow> for Rule {
    type Error = OrchestratorError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Rule {
            name: row.name,
            desc: row.description,
            value: row.value,
            level: parse_column("level", &row.level)?,
            rule_type: row.rule_type,
            is_default: row.is_default,
        })
    }
}

/// Task store backed by the `sqlgate` schema.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the schema and tables if they do not exist.
    pub async fn migrate(&self) -> OrchestratorResult<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        tracing::info!("Task store schema is up to date");
        Ok(())
    }

    async fn load(&self, row: TaskRow) -> OrchestratorResult<Task> {
        let execute_rows: Vec<ExecuteSqlRow> = sqlx::query_as(
            r#"
            SELECT task_id, number, content, fingerprint, audit_status, audit_level,
                   audit_result, exec_status, exec_result
            FROM sqlgate.execute_sql
            WHERE task_id = $1
            ORDER BY number
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let rollback_rows: Vec<RollbackSqlRow> = sqlx::query_as(
            r#"
            SELECT task_id, number, content, description, exec_status, exec_result
            FROM sqlgate.rollback_sql
            WHERE task_id = $1
            ORDER BY number
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let execute_sqls = execute_rows
            .into_iter()
            .map(ExecuteSql::try_from)
            .collect::<OrchestratorResult<Vec<_>>>()?;
        let rollback_sqls = rollback_rows
            .into_iter()
            .map(RollbackSql::try_from)
            .collect::<OrchestratorResult<Vec<_>>>()?;

        row.into_task(execute_sqls, rollback_sqls)
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn task(&self, id: TaskId) -> OrchestratorResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("{} WHERE t.id = $1", TASK_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn rules_by_instance(&self, instance_id: i64) -> OrchestratorResult<Vec<Rule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT name, description, value, level, rule_type, is_default
            FROM sqlgate.instance_rule
            WHERE instance_id = $1
            ORDER BY name
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Rule::try_from).collect()
    }

    async fn related_ddl_tasks(&self, task: &Task) -> OrchestratorResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"{}
            WHERE t.instance_id = $1
              AND t.schema_name = $2
              AND t.sql_type = 'ddl'
              AND t.status = 'audited'
              AND t.pass_rate = 1
              AND t.id <> $3
            ORDER BY t.id
            "#,
            TASK_SELECT
        ))
        .bind(task.instance.id)
        .bind(&task.schema)
        .bind(task.id)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.load(row).await?);
        }
        Ok(tasks)
    }

    async fn update_execute_sqls(
        &self,
        task_id: TaskId,
        sqls: &[ExecuteSql],
    ) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        for sql in sqls {
            sqlx::query(
                r#"
                UPDATE sqlgate.execute_sql
                SET fingerprint = $3, audit_status = $4, audit_level = $5, audit_result = $6,
                    exec_status = $7, exec_result = $8
                WHERE task_id = $1 AND number = $2
                "#,
            )
            .bind(task_id)
            .bind(sql.number as i32)
            .bind(&sql.fingerprint)
            .bind(sql.audit_status.as_str())
            .bind(sql.audit_level.map(|l| l.as_str()))
            .bind(&sql.audit_result)
            .bind(sql.exec_status.as_str())
            .bind(&sql.exec_result)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_rollback_sqls(
        &self,
        task_id: TaskId,
        sqls: &[RollbackSql],
    ) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sqlgate.rollback_sql WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        for sql in sqls {
            sqlx::query(
                r#"
                INSERT INTO sqlgate.rollback_sql
                    (task_id, number, content, description, exec_status, exec_result)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(task_id)
            .bind(sql.number as i32)
            .bind(&sql.content)
            .bind(&sql.description)
            .bind(sql.exec_status.as_str())
            .bind(&sql.exec_result)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_task_fields(
        &self,
        task_id: TaskId,
        fields: &[TaskField],
    ) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        for field in fields {
            let query = match field {
                TaskField::SqlType(sql_type) => {
                    sqlx::query("UPDATE sqlgate.task SET sql_type = $2 WHERE id = $1")
                        .bind(task_id)
                        .bind(sql_type.as_str())
                }
                TaskField::PassRate(rate) => {
                    sqlx::query("UPDATE sqlgate.task SET pass_rate = $2 WHERE id = $1")
                        .bind(task_id)
                        .bind(*rate)
                }
                TaskField::Status(status) => {
                    sqlx::query("UPDATE sqlgate.task SET status = $2 WHERE id = $1")
                        .bind(task_id)
                        .bind(status.as_str())
                }
            };
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
    ) -> OrchestratorResult<()> {
        let result = sqlx::query("UPDATE sqlgate.task SET status = $2 WHERE id = $1")
            .bind(task_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotExist(task_id));
        }
        Ok(())
    }

    async fn update_execute_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE sqlgate.execute_sql SET exec_status = $3, exec_result = $4
            WHERE task_id = $1 AND number = $2
            "#,
        )
        .bind(task_id)
        .bind(number as i32)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_rollback_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE sqlgate.rollback_sql SET exec_status = $3, exec_result = $4
            WHERE task_id = $1 AND number = $2
            "#,
        )
        .bind(task_id)
        .bind(number as i32)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_execute_sql(&self, sql: &ExecuteSql) -> OrchestratorResult<()> {
        self.update_execute_sqls(sql.task_id, std::slice::from_ref(sql))
            .await
    }

    async fn save_rollback_sql(&self, sql: &RollbackSql) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE sqlgate.rollback_sql
            SET content = $3, description = $4, exec_status = $5, exec_result = $6
            WHERE task_id = $1 AND number = $2
            "#,
        )
        .bind(sql.task_id)
        .bind(sql.number as i32)
        .bind(&sql.content)
        .bind(&sql.description)
        .bind(sql.exec_status.as_str())
        .bind(&sql.exec_result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execute_sql_status_by_task(
        &self,
        task_id: TaskId,
        status: ExecStatus,
    ) -> OrchestratorResult<()> {
        sqlx::query("UPDATE sqlgate.execute_sql SET exec_status = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_task(&self, new: NewTask) -> OrchestratorResult<Task> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sqlgate.task (instance_id, schema_name, sql_source, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(new.instance_id)
        .bind(&new.schema)
        .bind(new.sql_source.as_str())
        .bind(TaskStatus::Initialized.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for sql in &new.execute_sqls {
            sqlx::query(
                r#"
                INSERT INTO sqlgate.execute_sql (task_id, number, content, fingerprint)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(sql.number as i32)
            .bind(&sql.content)
            .bind(&sql.fingerprint)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(task_id = id, statements = new.execute_sqls.len(), "Task created");

        self.task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotExist(id))
    }

    async fn instance_by_name(&self, name: &str) -> OrchestratorResult<Option<Instance>> {
        let row: Option<InstanceRow> = sqlx::query_as(
            r#"
            SELECT id, name, db_type, host, port, db_user, db_password
            FROM sqlgate.instance
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Instance::from))
    }

    async fn is_healthy(&self) -> bool {
        health_check(&self.pool).await
    }
}
