//! `StartRun`, `Cancel`, `GetStatus`, `Subscribe`. Authentication
//! is out of scope — callers supply `tenant_id` directly.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::models::RunRow;
use db::Store;
use engine::{validate_dag, CoordinatorMessage, EngineError, Run, WorkflowSource};
use nodes::contract::{ExternalWake, StepOutcome};
use queue::{Bus, RunEventKind};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub workflow_id: Uuid,
    pub version: Option<i32>,
    pub tenant_id: String,
    pub trigger_payload: Value,
    #[serde(default)]
    pub priority: i32,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
}

fn engine_error_status(err: &EngineError) -> StatusCode {
    if err.is_invalid_workflow() {
        return StatusCode::BAD_REQUEST;
    }
    match err {
        EngineError::NotFound => StatusCode::NOT_FOUND,
        EngineError::AlreadyExists => StatusCode::CONFLICT,
        EngineError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Database(db::DbError::NotFound) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), (StatusCode, String)> {
    if let Some(key) = &req.idempotency_key {
        match state.store.find_run_by_start_key(key).await {
            Ok(Some(run_id)) => return Ok((StatusCode::OK, Json(StartRunResponse { run_id }))),
            Ok(None) => {}
            Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }

    let workflow = state
        .workflow_source
        .load(req.workflow_id, req.version.unwrap_or(1))
        .await
        .map_err(|e| (engine_error_status(&e), e.to_string()))?;

    validate_dag(&workflow).map_err(|e| (engine_error_status(&e), e.to_string()))?;

    let run = Run::new(&workflow, req.tenant_id, req.trigger_payload, req.priority);
    let run_id = run.id;

    state
        .supervisor
        .spawn_new_run(run, workflow, req.idempotency_key)
        .await
        .map_err(|e| (engine_error_status(&e), e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

pub async fn cancel(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunRow>, (StatusCode, String)> {
    let (row, _) = state
        .store
        .load_run(run_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    if let Some(inbox) = state.dispatcher.inbox(run_id) {
        let _ = inbox.send(CoordinatorMessage::Cancel).await;
    }
    // If there's no live inbox the run already finished (or this process
    // never owned it) — `GetStatus`/recovery remain the source of truth
    // either way.

    Ok(Json(row))
}

pub async fn get_status(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunSnapshot>, (StatusCode, String)> {
    let (row, steps) = state
        .store
        .load_run(run_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(RunSnapshot {
        id: row.id,
        workflow_id: row.workflow_id,
        tenant_id: row.tenant_id,
        state: row.state,
        node_states: row.node_states,
        failure_reason: row.failure_reason,
        created_at: row.created_at,
        started_at: row.started_at,
        finished_at: row.finished_at,
        attempt_count: steps.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExternalWakeRequest {
    pub wait_token: String,
    /// The outcome to resolve the waiting node with — typically
    /// `Succeeded`, but a poller may also report `Failed`.
    pub outcome: StepOutcome,
}

/// Redeems a wait token for an async/long-running node (§4.9). The
/// coordinator owns the token-to-node mapping; this handler only routes the
/// message to the right run's inbox, the same way `cancel` does.
pub async fn wake(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<ExternalWakeRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let Some(inbox) = state.dispatcher.inbox(run_id) else {
        return Err((StatusCode::NOT_FOUND, "no live coordinator for this run".into()));
    };

    let wake = ExternalWake { wait_token: req.wait_token, outcome: req.outcome };
    if inbox.send(CoordinatorMessage::ExternalWake(wake)).await.is_err() {
        return Err((StatusCode::NOT_FOUND, "run's inbox closed before delivery".into()));
    }

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
pub struct RunSnapshot {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub state: String,
    pub node_states: Value,
    pub failure_reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub attempt_count: usize,
}

/// Streams the current snapshot, then every subsequent event for `run_id`
/// until the run reaches a terminal state. Delivery
/// is best-effort: a slow or disconnected subscriber simply misses events
/// that were published while it wasn't listening, same as the broadcast
/// topic underneath (`stream::unfold` over a receiver, `KeepAlive` for idle
/// connections).
pub async fn subscribe(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let (row, _) = state
        .store
        .load_run(run_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    let snapshot = Event::default()
        .event("snapshot")
        .json_data(serde_json::json!({
            "run_id": row.id,
            "state": row.state,
            "node_states": row.node_states,
        }))
        .unwrap_or_else(|_| Event::default().data("{}"));

    let already_terminal = matches!(
        row.state.as_str(),
        "succeeded" | "failed" | "cancelled" | "timed_out"
    );

    let rx = state.bus.subscribe_events();
    let tail = futures::stream::unfold(
        (rx, already_terminal),
        move |(mut rx, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.run_id == run_id => {
                        let terminal = matches!(
                            event.kind,
                            RunEventKind::RunSucceeded
                                | RunEventKind::RunFailed { .. }
                                | RunEventKind::RunCancelled
                                | RunEventKind::RunTimedOut
                        );
                        let sse = Event::default()
                            .event("run_event")
                            .json_data(&event)
                            .unwrap_or_else(|_| Event::default().data("{}"));
                        return Some((Ok(sse), (rx, terminal)));
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    let stream = futures::stream::once(async move { Ok(snapshot) }).chain(tail);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
