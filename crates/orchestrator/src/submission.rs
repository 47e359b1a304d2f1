//! Task creation and instance metadata lookups.

use std::sync::Arc;

use serde::Deserialize;
use sqlgate_driver::protocol::{MetasResponse, Node};
use sqlgate_driver::Driver;

use crate::drivers::{DriverRegistry, DriverSession};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ExecuteSql, Instance, SqlSource, Task};
use crate::result_ext::ResultExt;
use crate::store::{NewTask, TaskStore};

/// Request body for creating a task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub instance_name: String,
    pub schema: String,
    pub sql: String,
    #[serde(default)]
    pub sql_source: SqlSource,
}

#[derive(Clone)]
pub struct TaskSubmission {
    store: Arc<dyn TaskStore>,
    drivers: DriverRegistry,
}

impl TaskSubmission {
    pub fn new(store: Arc<dyn TaskStore>, drivers: DriverRegistry) -> Self {
        Self { store, drivers }
    }

    /// Split `sql` into statements through the instance's backend and store
    /// them as a new `initialized` task.
    pub async fn create_task(&self, request: CreateTask) -> OrchestratorResult<Task> {
        if request.sql.trim().is_empty() {
            return Err(OrchestratorError::Validation("sql is empty".to_string()));
        }
        if request.schema.trim().is_empty() {
            return Err(OrchestratorError::Validation("schema is empty".to_string()));
        }

        let instance = self.instance(&request.instance_name).await?;
        let session = self.drivers.open(&instance, &request.schema).await?;
        let parsed = ping_and_parse(&*session, &request.sql).await;
        close(session, &instance).await;

        let nodes = parsed?;
        if nodes.is_empty() {
            return Err(OrchestratorError::Validation(
                "sql contains no statements".to_string(),
            ));
        }

        let execute_sqls = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| ExecuteSql::new(0, i as u32 + 1, node.text).with_fingerprint(node.fingerprint))
            .collect::<Vec<_>>();
        let statements = execute_sqls.len();

        let task = self
            .store
            .create_task(NewTask {
                instance_id: instance.id,
                schema: request.schema,
                sql_source: request.sql_source,
                execute_sqls,
            })
            .await
            .log("create task")?;

        tracing::info!(
            task_id = task.id,
            instance = %instance.name,
            schema = %task.schema,
            statements,
            "Task created"
        );
        Ok(task)
    }

    /// Schemas visible on an instance.
    pub async fn list_schemas(&self, instance_name: &str) -> OrchestratorResult<Vec<String>> {
        let instance = self.instance(instance_name).await?;
        let session = self.drivers.open(&instance, "").await?;
        let databases = session.databases().await;
        close(session, &instance).await;
        Ok(databases?)
    }

    /// Rules a backend supports.
    pub async fn rule_catalog(&self, db_type: &str) -> OrchestratorResult<MetasResponse> {
        let driver = self.drivers.factory(db_type)?.create();
        Ok(driver.metas().await?)
    }

    async fn instance(&self, name: &str) -> OrchestratorResult<Instance> {
        self.store
            .instance_by_name(name)
            .await
            .log("load instance")?
            .ok_or_else(|| OrchestratorError::InstanceNotExist(name.to_string()))
    }
}

async fn ping_and_parse(driver: &dyn Driver, sql: &str) -> OrchestratorResult<Vec<Node>> {
    driver.ping().await?;
    Ok(driver.parse(sql).await?)
}

async fn close(session: DriverSession, instance: &Instance) {
    if let Err(e) = session.close().await {
        tracing::warn!(instance = %instance.name, error = %e, "Failed to close driver session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::instance;
    use crate::model::TaskStatus;
    use crate::store::MemoryTaskStore;
    use sqlgate_driver::{DriverError, MemoryDriverFactory, MemoryState};

    async fn submission() -> (MemoryState, TaskSubmission) {
        let store = Arc::new(MemoryTaskStore::new());
        store.add_instance(instance(), Vec::new()).await;
        let state = MemoryState::new();
        let mut drivers = DriverRegistry::new();
        drivers.register("memory", Arc::new(MemoryDriverFactory::new(state.clone())));
        (state, TaskSubmission::new(store, drivers))
    }

    fn request(sql: &str) -> CreateTask {
        CreateTask {
            instance_name: "inst_1".to_string(),
            schema: "app".to_string(),
            sql: sql.to_string(),
            sql_source: SqlSource::Form,
        }
    }

    #[tokio::test]
    async fn test_create_task_splits_statements() {
        let (state, submission) = submission().await;
        let task = submission
            .create_task(request("CREATE TABLE t(id int);\nINSERT INTO t VALUES (1);"))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Initialized);
        assert_eq!(task.execute_sqls.len(), 2);
        assert_eq!(task.execute_sqls[0].number, 1);
        assert_eq!(task.execute_sqls[1].content, "INSERT INTO t VALUES (1)");
        assert_eq!(task.execute_sqls[1].fingerprint, "insert into t values (?)");
        assert_eq!(state.calls(), vec!["init", "ping", "parse", "close"]);
    }

    #[tokio::test]
    async fn test_create_task_rejects_empty_sql() {
        let (state, submission) = submission().await;
        let err = submission.create_task(request("  ")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(state.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_task_unknown_instance() {
        let (_state, submission) = submission().await;
        let mut req = request("SELECT 1");
        req.instance_name = "missing".to_string();
        assert!(matches!(
            submission.create_task(req).await,
            Err(OrchestratorError::InstanceNotExist(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_create_task_unreachable_instance() {
        let (state, submission) = submission().await;
        state.set_unreachable(true);
        assert!(matches!(
            submission.create_task(request("SELECT 1")).await,
            Err(OrchestratorError::Driver(DriverError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_parse_error_still_closes() {
        let (state, submission) = submission().await;
        assert!(matches!(
            submission.create_task(request("SHOW TABLES")).await,
            Err(OrchestratorError::Driver(DriverError::Parse(_)))
        ));
        assert_eq!(state.call_count("close"), 1);
    }

    #[tokio::test]
    async fn test_list_schemas_and_rules() {
        let (state, submission) = submission().await;
        state.set_databases(&["app", "billing"]);

        assert_eq!(submission.list_schemas("inst_1").await.unwrap(), vec!["app", "billing"]);
        let metas = submission.rule_catalog("memory").await.unwrap();
        assert_eq!(metas.name, "memory");
        assert!(!metas.rules.is_empty());
        assert!(matches!(
            submission.rule_catalog("oracle").await,
            Err(OrchestratorError::DriverNotFound(_))
        ));
    }
}
