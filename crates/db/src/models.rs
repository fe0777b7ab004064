//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON workflow definition (nodes, edges, trigger, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// A persisted run row.
///
/// `node_states` is an opaque JSON states map: a JSON
/// object of `node_id -> state` (as `engine::models::NodeState` renders via
/// its `Display`/`FromStr`). The `db` crate never deserializes it into an
/// `engine` type — that conversion happens one layer up, in `engine`, which
/// is the only crate that may depend on both `db` and its own domain model.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub tenant_id: String,
    pub trigger_payload: serde_json::Value,
    pub priority: i32,
    /// `engine::models::RunState` rendered as a string.
    pub state: String,
    pub node_states: serde_json::Value,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Dedup key for `StartRun`. `NULL` when
    /// the caller didn't supply one.
    pub start_idempotency_key: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// steps
// ---------------------------------------------------------------------------

/// A persisted step row — one attempt to execute one node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: i32,
    /// `engine::models::NodeState` rendered as a string.
    pub state: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    /// `UNIQUE` — makes `CommitStepResult` duplicate-safe.
    pub idempotency_key: String,
}

/// Result of `Store::commit_step_result` — distinguishes a fresh commit from
/// a duplicate delivery so the coordinator can publish exactly one
/// `step.succeeded`/`step.failed` event per real transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyCommitted,
}

/// The terminal disposition of one step attempt, as the `engine` crate wants
/// it written to the `steps` row. Kept string/JSON-typed (not an `engine`
/// enum) so `db` has no dependency on `engine`.
#[derive(Debug, Clone)]
pub struct StepOutcomeRecord {
    pub state: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}
