//! In-memory [`Store`] implementation.
//!
//! Backs engine/coordinator tests without a live Postgres instance.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{CommitOutcome, RunRow, StepOutcomeRecord, StepRow};
use crate::store::Store;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunRow>,
    steps: HashMap<Uuid, Vec<StepRow>>,
    step_index: HashMap<Uuid, (Uuid, usize)>, // step_id -> (run_id, index into steps[run_id])
    committed_keys: HashSet<String>,
    start_keys: HashMap<String, Uuid>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_run(&self, run: RunRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.runs.contains_key(&run.id) {
            return Err(DbError::AlreadyExists(run.id));
        }
        if let Some(key) = &run.start_idempotency_key {
            inner.start_keys.insert(key.clone(), run.id);
        }
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<(RunRow, Vec<StepRow>), DbError> {
        let inner = self.inner.lock().unwrap();
        let run = inner.runs.get(&run_id).cloned().ok_or(DbError::NotFound)?;
        let steps = inner.steps.get(&run_id).cloned().unwrap_or_default();
        Ok((run, steps))
    }

    async fn append_step_attempt(&self, step: StepRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        let run_id = step.run_id;
        let node_id = step.node_id.clone();
        let attempt = step.attempt;

        let existing = inner.steps.entry(run_id).or_default();
        let highest = existing
            .iter()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.attempt)
            .max()
            .unwrap_or(0);

        if attempt != highest + 1 {
            return Err(DbError::OutOfOrderAttempt {
                run_id,
                node_id,
                expected: (highest + 1) as u32,
                got: attempt as u32,
            });
        }

        let step_id = step.id;
        existing.push(step);
        let idx = existing.len() - 1;
        inner.step_index.insert(step_id, (run_id, idx));
        Ok(())
    }

    async fn commit_step_result(
        &self,
        step_id: Uuid,
        idempotency_key: &str,
        outcome: StepOutcomeRecord,
        new_node_states: serde_json::Value,
    ) -> Result<CommitOutcome, DbError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.committed_keys.contains(idempotency_key) {
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        let (run_id, idx) = *inner.step_index.get(&step_id).ok_or(DbError::NotFound)?;

        let now = Utc::now();
        {
            let step = &mut inner.steps.get_mut(&run_id).unwrap()[idx];
            step.state = outcome.state;
            step.output = outcome.output;
            step.error = outcome.error;
            step.duration_ms = outcome.duration_ms;
            step.finished_at = Some(now);
            step.idempotency_key = idempotency_key.to_string();
        }

        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.node_states = new_node_states;
        }

        inner.committed_keys.insert(idempotency_key.to_string());
        Ok(CommitOutcome::Committed)
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        from_state: &str,
        to_state: &str,
        reason: Option<String>,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&run_id).ok_or(DbError::NotFound)?;
        if run.state != from_state {
            return Err(DbError::StaleState { run_id, expected: from_state.to_string() });
        }
        run.state = to_state.to_string();
        if reason.is_some() {
            run.failure_reason = reason;
        }
        let now = Utc::now();
        if run.started_at.is_none() && to_state == "running" {
            run.started_at = Some(now);
        }
        if matches!(to_state, "succeeded" | "failed" | "cancelled" | "timed_out") {
            run.finished_at = Some(now);
        }
        Ok(())
    }

    async fn list_runs_needing_recovery(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, DbError> {
        let inner = self.inner.lock().unwrap();
        let terminal = ["succeeded", "failed", "cancelled", "timed_out"];
        Ok(inner
            .runs
            .values()
            .filter(|r| !terminal.contains(&r.state.as_str()))
            .filter(|r| r.lease_expiry.map_or(true, |exp| exp < now))
            .cloned()
            .collect())
    }

    async fn claim_run(&self, run_id: Uuid, owner: &str, lease_expiry: DateTime<Utc>) -> Result<bool, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let run = inner.runs.get_mut(&run_id).ok_or(DbError::NotFound)?;
        let held_by_other = run
            .lease_owner
            .as_deref()
            .map(|o| o != owner)
            .unwrap_or(false)
            && run.lease_expiry.map_or(false, |exp| exp > now);
        if held_by_other {
            return Ok(false);
        }
        run.lease_owner = Some(owner.to_string());
        run.lease_expiry = Some(lease_expiry);
        Ok(true)
    }

    async fn renew_lease(&self, run_id: Uuid, owner: &str, lease_expiry: DateTime<Utc>) -> Result<bool, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&run_id).ok_or(DbError::NotFound)?;
        if run.lease_owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        run.lease_expiry = Some(lease_expiry);
        Ok(true)
    }

    async fn find_run_by_start_key(&self, key: &str) -> Result<Option<Uuid>, DbError> {
        Ok(self.inner.lock().unwrap().start_keys.get(key).copied())
    }

    async fn persist_node_states(&self, run_id: Uuid, node_states: serde_json::Value) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&run_id).ok_or(DbError::NotFound)?;
        run.node_states = node_states;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run(id: Uuid) -> RunRow {
        RunRow {
            id,
            workflow_id: Uuid::new_v4(),
            workflow_version: 1,
            tenant_id: "t1".into(),
            trigger_payload: json!({}),
            priority: 0,
            state: "pending".into(),
            node_states: json!({}),
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            start_idempotency_key: None,
            lease_owner: None,
            lease_expiry: None,
        }
    }

    #[tokio::test]
    async fn duplicate_create_run_is_rejected() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_run(sample_run(id)).await.unwrap();
        let err = store.create_run(sample_run(id)).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn attempt_numbers_must_be_dense_and_increasing() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        store.create_run(sample_run(run_id)).await.unwrap();

        let step1 = StepRow {
            id: Uuid::new_v4(),
            run_id,
            node_id: "a".into(),
            attempt: 1,
            state: "dispatched".into(),
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            input: json!({}),
            output: None,
            error: None,
            duration_ms: None,
            idempotency_key: "k1".into(),
        };
        store.append_step_attempt(step1).await.unwrap();

        let mut step3 = StepRow {
            id: Uuid::new_v4(),
            run_id,
            node_id: "a".into(),
            attempt: 3,
            state: "dispatched".into(),
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            input: json!({}),
            output: None,
            error: None,
            duration_ms: None,
            idempotency_key: "k3".into(),
        };
        let err = store.append_step_attempt(step3.clone()).await.unwrap_err();
        assert!(matches!(err, DbError::OutOfOrderAttempt { .. }));

        step3.attempt = 2;
        store.append_step_attempt(step3).await.unwrap();
    }

    #[tokio::test]
    async fn commit_step_result_is_idempotent() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        store.create_run(sample_run(run_id)).await.unwrap();

        let step_id = Uuid::new_v4();
        store
            .append_step_attempt(StepRow {
                id: step_id,
                run_id,
                node_id: "a".into(),
                attempt: 1,
                state: "dispatched".into(),
                queued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                input: json!({}),
                output: None,
                error: None,
                duration_ms: None,
                idempotency_key: String::new(),
            })
            .await
            .unwrap();

        let outcome = StepOutcomeRecord {
            state: "succeeded".into(),
            output: Some(json!({"ok": true})),
            error: None,
            duration_ms: Some(5),
        };

        let first = store
            .commit_step_result(step_id, "run:a:1", outcome.clone(), json!({"a": "succeeded"}))
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Committed);

        let second = store
            .commit_step_result(step_id, "run:a:1", outcome, json!({"a": "succeeded"}))
            .await
            .unwrap();
        assert_eq!(second, CommitOutcome::AlreadyCommitted);
    }

    #[tokio::test]
    async fn update_run_state_cas_rejects_stale_from_state() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        store.create_run(sample_run(run_id)).await.unwrap();

        store.update_run_state(run_id, "pending", "running", None).await.unwrap();
        let err = store
            .update_run_state(run_id, "pending", "running", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::StaleState { .. }));
    }
}
