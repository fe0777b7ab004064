//! Webhook ingress: matches `/webhook/{path}` against each workflow's
//! `Trigger::Webhook` and starts a run directly through the same path
//! `StartRun` uses. Authentication is out of scope — the
//! delivery's tenant comes from a plain header, defaulting to `"default"`.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::Value;

use db::repository::workflows as wf_repo;
use db::Store;
use engine::{validate_dag, Run, Workflow};

use crate::AppState;

pub async fn handle_webhook(
    Path(path): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let workflows = wf_repo::list_workflows(&state.pool)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let matched = workflows.into_iter().find_map(|row| {
        let workflow: Workflow = serde_json::from_value(row.definition.clone()).ok()?;
        match &workflow.trigger {
            engine::Trigger::Webhook { path: trigger_path } if trigger_path == &path => Some(workflow),
            _ => None,
        }
    });

    let workflow = match matched {
        Some(w) => std::sync::Arc::new(w),
        None => return Err((StatusCode::NOT_FOUND, format!("no workflow listens on '{path}'"))),
    };

    validate_dag(&workflow).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();

    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(key) = &idempotency_key {
        if let Some(run_id) = state
            .store
            .find_run_by_start_key(key)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        {
            return Ok((StatusCode::OK, Json(serde_json::json!({"run_id": run_id}))));
        }
    }

    let run = Run::new(&workflow, tenant_id, payload, 0);
    let run_id = run.id;

    state
        .supervisor
        .spawn_new_run(run, workflow, idempotency_key)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"run_id": run_id}))))
}
