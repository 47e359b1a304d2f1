//! HTTP handlers for the sqlgated API.

pub mod health;
pub mod instances;
pub mod tasks;

pub use health::{api_health, health_check};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Build the application router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health));

    let task_routes = Router::new()
        .route("/api/tasks", post(tasks::create))
        .route("/api/tasks/audit", post(tasks::create_and_audit))
        .route("/api/tasks/{task_id}", get(tasks::get))
        .route("/api/tasks/{task_id}/sqls", get(tasks::list_sqls))
        .route("/api/tasks/{task_id}/running", get(tasks::running))
        .route(
            "/api/tasks/{task_id}/actions/{action}",
            post(tasks::run_action),
        );

    let instance_routes = Router::new()
        .route(
            "/api/instances/{instance_name}/schemas",
            get(instances::schemas),
        )
        .route("/api/drivers/{db_type}/rules", get(instances::rules));

    Router::new()
        .merge(health_routes)
        .merge(task_routes)
        .merge(instance_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use sqlgate_driver::{MemoryDriverFactory, MemoryState};
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;
    use crate::drivers::DriverRegistry;
    use crate::model::testing::instance;
    use crate::scheduler::Scheduler;
    use crate::store::MemoryTaskStore;
    use crate::submission::TaskSubmission;
    use crate::workflow::Workflows;

    async fn app() -> Router {
        let store = Arc::new(MemoryTaskStore::new());
        store.add_instance(instance(), Vec::new()).await;

        let mut drivers = DriverRegistry::new();
        drivers.register("memory", Arc::new(MemoryDriverFactory::new(MemoryState::new())));

        let workflows = Arc::new(Workflows::new(store.clone(), drivers.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            workflows,
            16,
            Duration::from_secs(1),
        ));
        scheduler.start().unwrap();

        let submission = TaskSubmission::new(store.clone(), drivers);
        router(AppState::new(scheduler, store, submission, AppConfig::default()))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "connected");
    }

    #[tokio::test]
    async fn test_create_audit_and_commit() {
        let app = app().await;
        let (status, task) = call(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({
                "instance_name": "inst_1",
                "schema": "app",
                "sql": "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "initialized");
        let id = task["id"].as_i64().unwrap();

        let (status, task) = call(&app, "POST", &format!("/api/tasks/{id}/actions/audit?wait=true"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "audited");
        assert_eq!(task["sql_type"], "dml");
        assert_eq!(task["pass_rate"], 1.0);

        let (status, task) = call(&app, "POST", &format!("/api/tasks/{id}/actions/commit?wait=true"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "exec_success");

        let (status, body) = call(&app, "GET", &format!("/api/tasks/{id}/sqls?no_duplicate=true"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_nums"], 1);
        assert_eq!(body["sqls"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", &format!("/api/tasks/{id}/sqls?page_index=2&page_size=1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_nums"], 2);
        assert_eq!(body["sqls"][0]["number"], 2);
        assert_eq!(body["sqls"][0]["exec_status"], "succeeded");

        let (status, body) = call(&app, "GET", &format!("/api/tasks/{id}/running"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_create_and_audit() {
        let app = app().await;
        let (status, task) = call(
            &app,
            "POST",
            "/api/tasks/audit",
            Some(json!({
                "instance_name": "inst_1",
                "schema": "app",
                "sql": "CREATE TABLE t2(id int primary key); DROP TABLE t3;"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "audited");
        assert_eq!(task["sql_type"], "ddl");
        let id = task["id"].as_i64().unwrap();

        let (status, body) = call(&app, "GET", &format!("/api/tasks/{id}/sqls"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_nums"], 2);
        assert_eq!(body["sqls"][0]["rollback_sql"], "DROP TABLE t2");
        assert_eq!(body["sqls"][1]["rollback_sql"], "");

        let (status, _) = call(
            &app,
            "POST",
            "/api/tasks/audit",
            Some(json!({"instance_name": "missing", "schema": "app", "sql": "DROP TABLE t"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_action_errors() {
        let app = app().await;
        let (status, body) = call(&app, "POST", "/api/tasks/99/actions/audit", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);

        let (_, task) = call(
            &app,
            "POST",
            "/api/tasks",
            Some(json!({"instance_name": "inst_1", "schema": "app", "sql": "DELETE FROM t WHERE id = 1"})),
        )
        .await;
        let id = task["id"].as_i64().unwrap();

        let (status, _) = call(&app, "POST", &format!("/api/tasks/{id}/actions/rollback"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&app, "POST", &format!("/api/tasks/{id}/actions/explode"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unknown_instance_and_rules() {
        let app = app().await;
        let (status, _) = call(&app, "GET", "/api/instances/missing/schemas", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/api/instances/inst_1/schemas", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schemas"], json!(["information_schema", "app"]));

        let (status, body) = call(&app, "GET", "/api/drivers/memory/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "memory");

        let (status, _) = call(&app, "GET", "/api/drivers/oracle/rules", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
