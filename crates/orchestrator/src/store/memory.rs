//! In-process task store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use sqlgate_driver::protocol::Rule;
use tokio::sync::RwLock;

use super::{is_related_ddl, NewTask, TaskStore};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    ExecStatus, ExecuteSql, Instance, RollbackSql, Task, TaskField, TaskId, TaskStatus,
};

#[derive(Default)]
struct Inner {
    instances: HashMap<i64, Instance>,
    rules: HashMap<i64, Vec<Rule>>,
    tasks: BTreeMap<TaskId, Task>,
    next_instance_id: i64,
    next_task_id: TaskId,
}

impl Inner {
    fn task_mut(&mut self, id: TaskId) -> OrchestratorResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::TaskNotExist(id))
    }

    fn execute_sql_mut(&mut self, task_id: TaskId, number: u32) -> OrchestratorResult<&mut ExecuteSql> {
        self.task_mut(task_id)?
            .execute_sqls
            .iter_mut()
            .find(|s| s.number == number)
            .ok_or_else(|| {
                OrchestratorError::Storage(format!(
                    "statement {} of task {} not found",
                    number, task_id
                ))
            })
    }

    fn rollback_sql_mut(&mut self, task_id: TaskId, number: u32) -> OrchestratorResult<&mut RollbackSql> {
        self.task_mut(task_id)?
            .rollback_sqls
            .iter_mut()
            .find(|s| s.number == number)
            .ok_or_else(|| {
                OrchestratorError::Storage(format!(
                    "rollback statement {} of task {} not found",
                    number, task_id
                ))
            })
    }

    /// Copy of a stored task with its instance refreshed.
    fn snapshot(&self, task: &Task) -> Task {
        let mut task = task.clone();
        if let Some(instance) = self.instances.get(&task.instance.id) {
            task.instance = instance.clone();
        }
        task.sort_sqls();
        task
    }
}

/// Task store kept in memory, used by tests and single-process setups.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance with its audit rules; the id is assigned here.
    pub async fn add_instance(&self, mut instance: Instance, rules: Vec<Rule>) -> Instance {
        let mut inner = self.inner.write().await;
        inner.next_instance_id += 1;
        instance.id = inner.next_instance_id;
        inner.rules.insert(instance.id, rules);
        inner.instances.insert(instance.id, instance.clone());
        instance
    }

    /// Store a fully built task as is, assigning a fresh id.
    pub async fn insert_task(&self, mut task: Task) -> TaskId {
        let mut inner = self.inner.write().await;
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        task.id = id;
        for sql in &mut task.execute_sqls {
            sql.task_id = id;
        }
        for sql in &mut task.rollback_sqls {
            sql.task_id = id;
        }
        inner.tasks.insert(id, task);
        id
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn task(&self, id: TaskId) -> OrchestratorResult<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(&id).map(|t| inner.snapshot(t)))
    }

    async fn rules_by_instance(&self, instance_id: i64) -> OrchestratorResult<Vec<Rule>> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn related_ddl_tasks(&self, task: &Task) -> OrchestratorResult<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|candidate| is_related_ddl(task, candidate))
            .map(|t| inner.snapshot(t))
            .collect())
    }

    async fn update_execute_sqls(
        &self,
        task_id: TaskId,
        sqls: &[ExecuteSql],
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        for sql in sqls {
            let stored = inner.execute_sql_mut(task_id, sql.number)?;
            *stored = ExecuteSql {
                nodes: Vec::new(),
                ..sql.clone()
            };
        }
        Ok(())
    }

    async fn update_rollback_sqls(
        &self,
        task_id: TaskId,
        sqls: &[RollbackSql],
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        inner.task_mut(task_id)?.rollback_sqls = sqls.to_vec();
        Ok(())
    }

    async fn update_task_fields(
        &self,
        task_id: TaskId,
        fields: &[TaskField],
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        for field in fields {
            match *field {
                TaskField::SqlType(sql_type) => task.sql_type = Some(sql_type),
                TaskField::PassRate(rate) => task.pass_rate = rate,
                TaskField::Status(status) => task.status = status,
            }
        }
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
    ) -> OrchestratorResult<()> {
        self.inner.write().await.task_mut(task_id)?.status = status;
        Ok(())
    }

    async fn update_execute_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        let sql = inner.execute_sql_mut(task_id, number)?;
        sql.exec_status = status;
        sql.exec_result = result.to_string();
        Ok(())
    }

    async fn update_rollback_sql_status(
        &self,
        task_id: TaskId,
        number: u32,
        status: ExecStatus,
        result: &str,
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        let sql = inner.rollback_sql_mut(task_id, number)?;
        sql.exec_status = status;
        sql.exec_result = result.to_string();
        Ok(())
    }

    async fn save_execute_sql(&self, sql: &ExecuteSql) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner.execute_sql_mut(sql.task_id, sql.number)?;
        *stored = ExecuteSql {
            nodes: Vec::new(),
            ..sql.clone()
        };
        Ok(())
    }

    async fn save_rollback_sql(&self, sql: &RollbackSql) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        *inner.rollback_sql_mut(sql.task_id, sql.number)? = sql.clone();
        Ok(())
    }

    async fn update_execute_sql_status_by_task(
        &self,
        task_id: TaskId,
        status: ExecStatus,
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().await;
        for sql in &mut inner.task_mut(task_id)?.execute_sqls {
            sql.exec_status = status;
        }
        Ok(())
    }

    async fn create_task(&self, new: NewTask) -> OrchestratorResult<Task> {
        let instance = self
            .inner
            .read()
            .await
            .instances
            .get(&new.instance_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotExist(new.instance_id.to_string()))?;

        let task = Task {
            id: 0,
            instance,
            schema: new.schema,
            sql_source: new.sql_source,
            sql_type: None,
            pass_rate: 0.0,
            status: TaskStatus::Initialized,
            execute_sqls: new.execute_sqls,
            rollback_sqls: Vec::new(),
            created_at: Utc::now(),
        };
        let id = self.insert_task(task).await;

        self.task(id)
            .await?
            .ok_or(OrchestratorError::TaskNotExist(id))
    }

    async fn instance_by_name(&self, name: &str) -> OrchestratorResult<Option<Instance>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .find(|i| i.name == name)
            .cloned())
    }
}
