//! The `Store` trait — durable persistence of runs, steps, and idempotency
//! keys.
//!
//! All writes that cross step and run rows are one transaction; a partial
//! write is fatal for that request and the caller must retry until it
//! succeeds — `Store` implementations never
//! return a partially-applied result, they return `Err` and leave prior
//! state untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{CommitOutcome, RunRow, StepOutcomeRecord, StepRow};

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic insert. `DbError::AlreadyExists` on a duplicate run id.
    async fn create_run(&self, run: RunRow) -> Result<(), DbError>;

    /// Used on coordinator recovery: the run row plus every step recorded
    /// for it so far.
    async fn load_run(&self, run_id: Uuid) -> Result<(RunRow, Vec<StepRow>), DbError>;

    /// Monotone append. `attempt` must be strictly greater than the highest
    /// attempt already recorded for `(run_id, node_id)`.
    async fn append_step_attempt(&self, step: StepRow) -> Result<(), DbError>;

    /// Single transaction: writes the step row, updates the run's node-state
    /// map, and records `idempotency_key`. Returns `AlreadyCommitted` — not
    /// an error — when the key was already present (duplicate delivery).
    async fn commit_step_result(
        &self,
        step_id: Uuid,
        idempotency_key: &str,
        outcome: StepOutcomeRecord,
        new_node_states: serde_json::Value,
    ) -> Result<CommitOutcome, DbError>;

    /// Compare-and-swap. `DbError::StaleState` if the row's current state
    /// no longer matches `from_state`.
    async fn update_run_state(
        &self,
        run_id: Uuid,
        from_state: &str,
        to_state: &str,
        reason: Option<String>,
    ) -> Result<(), DbError>;

    /// Runs in a non-terminal state whose lease has expired as of `now`.
    async fn list_runs_needing_recovery(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, DbError>;

    /// Compare-and-swap claim of the run's lease. `Ok(false)` (not an error)
    /// when another owner currently holds an unexpired lease.
    async fn claim_run(
        &self,
        run_id: Uuid,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Renew a lease already held by `owner`. `Ok(false)` if `owner` no
    /// longer matches the row (lost the lease to a recovery scan).
    async fn renew_lease(
        &self,
        run_id: Uuid,
        owner: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Look up a run previously created with this `StartRun` idempotency
    /// key.
    async fn find_run_by_start_key(&self, key: &str) -> Result<Option<Uuid>, DbError>;

    /// Persist a node-state map recomputed without an accompanying step
    /// commit (Ready/Skipped fan-out after a predecessor finishes).
    /// `commit_step_result` covers the state transitions that happen
    /// alongside a step result, but the scheduler also derives Ready/Skipped
    /// states for downstream nodes with no step of their own yet, and those
    /// still need to survive a coordinator crash.
    async fn persist_node_states(
        &self,
        run_id: Uuid,
        node_states: serde_json::Value,
    ) -> Result<(), DbError>;
}
