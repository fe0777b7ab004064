//! Engine-level error types — a taxonomy of kinds, not just strings, so
//! callers can `match` on what happened.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation (surfaced synchronously from StartRun as
    //        `InvalidWorkflow`) ------
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference { node_id: String, side: &'static str },

    #[error("workflow graph contains a cycle")]
    CycleDetected,

    // ------ Run-lifecycle taxonomy ------
    /// Store/Bus/network blip. Retried internally; never surfaces as a run
    /// failure unless retries are exhausted.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// A non-retryable node failure where the node is marked critical —
    /// fails the whole run.
    #[error("node '{node_id}' failed fatally: {message}")]
    RunFatal { node_id: String, message: String },

    /// User-initiated cancellation, or superseded by a newer run on the
    /// same start idempotency key.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    /// Step deadline or run deadline exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed runner response, unknown node type, or invalid workflow
    /// encountered mid-run (as opposed to at StartRun time).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    // ------ ControlAPI synchronous failures ------
    #[error("run already exists for idempotency key")]
    AlreadyExists,

    #[error("quota exceeded for tenant")]
    QuotaExceeded,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("run not found")]
    NotFound,

    #[error("run {run_id} is not in expected state {expected}")]
    StaleState { run_id: uuid::Uuid, expected: String },

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// Messaging error from the queue crate.
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl EngineError {
    /// Whether this is one of the DAG-validation variants `StartRun`
    /// surfaces synchronously as `InvalidWorkflow`.
    pub fn is_invalid_workflow(&self) -> bool {
        matches!(
            self,
            Self::EmptyWorkflow | Self::DuplicateNodeId(_) | Self::UnknownNodeReference { .. } | Self::CycleDetected
        )
    }
}
