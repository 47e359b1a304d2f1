//! Task endpoints.

use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ActionKind, AuditStatus, ExecStatus, ExecuteSql, RollbackSql, Task, TaskId};
use crate::state::AppState;
use crate::submission::CreateTask;

/// Query parameters of the statement listing.
#[derive(Debug, Default, Deserialize)]
pub struct SqlFilter {
    pub filter_exec_status: Option<ExecStatus>,
    pub filter_audit_status: Option<AuditStatus>,
    /// Keep only the first statement of each fingerprint and audit verdict.
    #[serde(default)]
    pub no_duplicate: bool,
    /// 1-based page, used together with `page_size`.
    pub page_index: Option<usize>,
    /// Unpaged when absent or zero.
    pub page_size: Option<usize>,
}

/// A listed statement with its compensating statement.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskSqlView {
    #[serde(flatten)]
    pub sql: ExecuteSql,
    pub rollback_sql: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SqlListResponse {
    /// Matching statements before paging.
    pub total_nums: usize,
    pub sqls: Vec<TaskSqlView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub task_id: TaskId,
    pub action: ActionKind,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunningResponse {
    pub task_id: TaskId,
    pub running: bool,
}

async fn load_task(state: &AppState, task_id: TaskId) -> OrchestratorResult<Task> {
    state
        .store
        .task(task_id)
        .await?
        .ok_or(OrchestratorError::TaskNotExist(task_id))
}

/// `POST /api/tasks`
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateTask>,
) -> OrchestratorResult<(StatusCode, Json<Task>)> {
    let task = state.submission.create_task(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `POST /api/tasks/audit`
///
/// Creates the task and audits it before answering.
pub async fn create_and_audit(
    State(state): State<AppState>,
    Json(request): Json<CreateTask>,
) -> OrchestratorResult<(StatusCode, Json<Task>)> {
    let task = state.submission.create_task(request).await?;
    let task = state
        .scheduler
        .enqueue_and_wait(task.id, ActionKind::Audit)
        .await?
        .into_result()?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /api/tasks/{task_id}`
pub async fn get(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> OrchestratorResult<Json<Task>> {
    Ok(Json(load_task(&state, task_id).await?))
}

/// `GET /api/tasks/{task_id}/sqls`
pub async fn list_sqls(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Query(filter): Query<SqlFilter>,
) -> OrchestratorResult<Json<SqlListResponse>> {
    let task = load_task(&state, task_id).await?;
    let sqls = filter_sqls(task.execute_sqls, &filter);
    let total_nums = sqls.len();
    let sqls = with_rollback(page(sqls, &filter), task.rollback_sqls);
    Ok(Json(SqlListResponse { total_nums, sqls }))
}

fn filter_sqls(sqls: Vec<ExecuteSql>, filter: &SqlFilter) -> Vec<ExecuteSql> {
    let mut seen = HashSet::new();
    sqls.into_iter()
        .filter(|s| filter.filter_exec_status.is_none_or(|status| s.exec_status == status))
        .filter(|s| filter.filter_audit_status.is_none_or(|status| s.audit_status == status))
        .filter(|s| {
            !filter.no_duplicate
                || seen.insert((s.fingerprint.clone(), s.audit_level, s.audit_result.clone()))
        })
        .collect()
}

fn page(sqls: Vec<ExecuteSql>, filter: &SqlFilter) -> Vec<ExecuteSql> {
    let size = match filter.page_size {
        Some(size) if size > 0 => size,
        _ => return sqls,
    };
    let index = filter.page_index.unwrap_or(1).max(1);
    sqls.into_iter()
        .skip((index - 1).saturating_mul(size))
        .take(size)
        .collect()
}

fn with_rollback(sqls: Vec<ExecuteSql>, rollback_sqls: Vec<RollbackSql>) -> Vec<TaskSqlView> {
    let mut rollback: HashMap<u32, String> = rollback_sqls
        .into_iter()
        .map(|r| (r.number, r.content))
        .collect();
    sqls.into_iter()
        .map(|sql| TaskSqlView {
            rollback_sql: rollback.remove(&sql.number).unwrap_or_default(),
            sql,
        })
        .collect()
}

/// `POST /api/tasks/{task_id}/actions/{action}`
///
/// Queues the action and answers `202 Accepted`. With `?wait=true` the
/// response is held until the action has run and carries the stored task.
pub async fn run_action(
    State(state): State<AppState>,
    Path((task_id, action)): Path<(TaskId, String)>,
    Query(query): Query<ActionQuery>,
) -> OrchestratorResult<Response> {
    let action: ActionKind = action.parse().map_err(OrchestratorError::Validation)?;

    if query.wait {
        let task = state
            .scheduler
            .enqueue_and_wait(task_id, action)
            .await?
            .into_result()?;
        return Ok(Json(task).into_response());
    }

    state.scheduler.enqueue(task_id, action).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            task_id,
            action,
            status: "queued".to_string(),
        }),
    )
        .into_response())
}

/// `GET /api/tasks/{task_id}/running`
pub async fn running(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Json<RunningResponse> {
    Json(RunningResponse {
        task_id,
        running: state.scheduler.has_task(task_id),
    })
}
