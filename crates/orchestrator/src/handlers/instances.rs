//! Instance metadata endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlgate_driver::protocol::MetasResponse;

use crate::error::OrchestratorResult;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SchemasResponse {
    pub instance: String,
    pub schemas: Vec<String>,
}

/// `GET /api/instances/{instance_name}/schemas`
pub async fn schemas(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
) -> OrchestratorResult<Json<SchemasResponse>> {
    let schemas = state.submission.list_schemas(&instance_name).await?;
    Ok(Json(SchemasResponse {
        instance: instance_name,
        schemas,
    }))
}

/// `GET /api/drivers/{db_type}/rules`
pub async fn rules(
    State(state): State<AppState>,
    Path(db_type): Path<String>,
) -> OrchestratorResult<Json<MetasResponse>> {
    Ok(Json(state.submission.rule_catalog(&db_type).await?))
}
