//! Workflow ingestion: create and read only. No REST CRUD surface (update,
//! delete, list) — authoring/editing a workflow definition is an authoring-UI
//! concern the execution plane doesn't own.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use uuid::Uuid;

use db::repository::workflows as wf_repo;
use engine::{validate_dag, Workflow};

use crate::AppState;

#[derive(serde::Deserialize)]
pub struct CreateWorkflowDto {
    pub name: String,
    pub definition: Value,
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowDto>,
) -> Result<(StatusCode, Json<db::models::WorkflowRow>), (StatusCode, String)> {
    let workflow: Workflow = serde_json::from_value(payload.definition.clone())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid workflow definition: {e}")))?;

    validate_dag(&workflow).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let row = wf_repo::create_workflow(&state.pool, &payload.name, payload.definition)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<db::models::WorkflowRow>, StatusCode> {
    match wf_repo::get_workflow(&state.pool, id).await {
        Ok(wf) => Ok(Json(wf)),
        Err(db::DbError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
