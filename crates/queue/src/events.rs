//! Run/step lifecycle events carried on the best-effort event topic
//! (`run.event`).
//!
//! Defined here rather than in `engine` so the `Bus` trait can carry them
//! without `queue` depending back on `engine`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of lifecycle transition an event reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    /// Any node-state-map change.
    RunProgress,
    StepStarted { node_id: String, attempt: u32 },
    StepSucceeded { node_id: String, attempt: u32 },
    StepFailed { node_id: String, attempt: u32, message: String },
    StepRetryScheduled { node_id: String, attempt: u32, after_ms: u64 },
    RunSucceeded,
    RunFailed { reason: String },
    RunCancelled,
    RunTimedOut,
}

/// One published event. `sequence` is strictly increasing per `run_id` only
/// — clients use gaps in it to detect missed
/// best-effort deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub sequence: u64,
    pub kind: RunEventKind,
    pub emitted_at: DateTime<Utc>,
}
