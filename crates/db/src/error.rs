//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// `CreateRun` on a duplicate run id.
    #[error("run already exists: {0}")]
    AlreadyExists(uuid::Uuid),

    /// `UpdateRunState` compare-and-swap failed: `from_state` didn't match
    /// the row's current state.
    #[error("run {run_id} is not in expected state {expected}")]
    StaleState { run_id: uuid::Uuid, expected: String },

    /// `AppendStepAttempt` with an attempt number that isn't the next one.
    #[error("step attempt out of order for run {run_id} node {node_id}: expected {expected}, got {got}")]
    OutOfOrderAttempt {
        run_id: uuid::Uuid,
        node_id: String,
        expected: u32,
        got: u32,
    },

    /// Lease compare-and-swap failed — another coordinator owns the run.
    #[error("lease conflict for run {0}")]
    LeaseConflict(uuid::Uuid),
}
