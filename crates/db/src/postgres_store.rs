//! Postgres-backed [`Store`] implementation.
//!
//! Uses the runtime `sqlx::query`/`query_as` API (not the `query!` macros
//! the rest of this crate's CRUD repositories use) so this module doesn't
//! require a live database or cached query metadata to type-check — the
//! schema here (`runs`, `steps`) is new and doesn't yet have migrations
//! checked in under every environment this crate builds in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{CommitOutcome, RunRow, StepOutcomeRecord, StepRow};
use crate::store::Store;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_row_from(row: &sqlx::postgres::PgRow) -> Result<RunRow, DbError> {
    Ok(RunRow {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        workflow_version: row.try_get("workflow_version")?,
        tenant_id: row.try_get("tenant_id")?,
        trigger_payload: row.try_get("trigger_payload")?,
        priority: row.try_get("priority")?,
        state: row.try_get("state")?,
        node_states: row.try_get("node_states")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        start_idempotency_key: row.try_get("start_idempotency_key")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expiry: row.try_get("lease_expiry")?,
    })
}

fn step_row_from(row: &sqlx::postgres::PgRow) -> Result<StepRow, DbError> {
    Ok(StepRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        attempt: row.try_get("attempt")?,
        state: row.try_get("state")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_run(&self, run: RunRow) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs
                (id, workflow_id, workflow_version, tenant_id, trigger_payload, priority,
                 state, node_states, failure_reason, created_at, started_at, finished_at,
                 start_idempotency_key, lease_owner, lease_expiry)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(run.id)
        .bind(run.workflow_id)
        .bind(run.workflow_version)
        .bind(&run.tenant_id)
        .bind(&run.trigger_payload)
        .bind(run.priority)
        .bind(&run.state)
        .bind(&run.node_states)
        .bind(&run.failure_reason)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.start_idempotency_key)
        .bind(&run.lease_owner)
        .bind(run.lease_expiry)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::AlreadyExists(run.id)),
            Err(e) => Err(DbError::Sqlx(e)),
        }
    }

    async fn load_run(&self, run_id: Uuid) -> Result<(RunRow, Vec<StepRow>), DbError> {
        let run_row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        let run = run_row_from(&run_row)?;

        let step_rows = sqlx::query("SELECT * FROM steps WHERE run_id = $1 ORDER BY node_id, attempt")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let steps = step_rows.iter().map(step_row_from).collect::<Result<Vec<_>, _>>()?;

        Ok((run, steps))
    }

    async fn append_step_attempt(&self, step: StepRow) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        let highest: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(attempt) FROM steps WHERE run_id = $1 AND node_id = $2",
        )
        .bind(step.run_id)
        .bind(&step.node_id)
        .fetch_one(&mut *tx)
        .await?;

        let expected = highest.unwrap_or(0) + 1;
        if step.attempt != expected {
            return Err(DbError::OutOfOrderAttempt {
                run_id: step.run_id,
                node_id: step.node_id,
                expected: expected as u32,
                got: step.attempt as u32,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO steps
                (id, run_id, node_id, attempt, state, queued_at, started_at, finished_at,
                 input, output, error, duration_ms, idempotency_key)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            "#,
        )
        .bind(step.id)
        .bind(step.run_id)
        .bind(&step.node_id)
        .bind(step.attempt)
        .bind(&step.state)
        .bind(step.queued_at)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.duration_ms)
        .bind(&step.idempotency_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_step_result(
        &self,
        step_id: Uuid,
        idempotency_key: &str,
        outcome: StepOutcomeRecord,
        new_node_states: serde_json::Value,
    ) -> Result<CommitOutcome, DbError> {
        let mut tx = self.pool.begin().await?;

        let already: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM steps WHERE idempotency_key = $1 AND finished_at IS NOT NULL)",
        )
        .bind(idempotency_key)
        .fetch_one(&mut *tx)
        .await?;
        if already {
            tx.rollback().await?;
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        let run_id: Uuid = sqlx::query_scalar("SELECT run_id FROM steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

        sqlx::query(
            r#"
            UPDATE steps
            SET state = $1, output = $2, error = $3, duration_ms = $4,
                finished_at = now(), idempotency_key = $5
            WHERE id = $6
            "#,
        )
        .bind(&outcome.state)
        .bind(&outcome.output)
        .bind(&outcome.error)
        .bind(outcome.duration_ms)
        .bind(idempotency_key)
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE runs SET node_states = $1 WHERE id = $2")
            .bind(&new_node_states)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        from_state: &str,
        to_state: &str,
        reason: Option<String>,
    ) -> Result<(), DbError> {
        let terminal = matches!(to_state, "succeeded" | "failed" | "cancelled" | "timed_out");
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = $1,
                failure_reason = COALESCE($2, failure_reason),
                started_at = CASE WHEN started_at IS NULL AND $1 = 'running' THEN now() ELSE started_at END,
                finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
            WHERE id = $4 AND state = $5
            "#,
        )
        .bind(to_state)
        .bind(&reason)
        .bind(terminal)
        .bind(run_id)
        .bind(from_state)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::StaleState { run_id, expected: from_state.to_string() });
        }
        Ok(())
    }

    async fn list_runs_needing_recovery(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE state NOT IN ('succeeded', 'failed', 'cancelled', 'timed_out')
              AND (lease_expiry IS NULL OR lease_expiry < $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_row_from).collect()
    }

    async fn claim_run(&self, run_id: Uuid, owner: &str, lease_expiry: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET lease_owner = $1, lease_expiry = $2
            WHERE id = $3 AND (lease_owner IS NULL OR lease_owner = $1 OR lease_expiry < now())
            "#,
        )
        .bind(owner)
        .bind(lease_expiry)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(&self, run_id: Uuid, owner: &str, lease_expiry: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE runs SET lease_expiry = $1 WHERE id = $2 AND lease_owner = $3")
            .bind(lease_expiry)
            .bind(run_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_run_by_start_key(&self, key: &str) -> Result<Option<Uuid>, DbError> {
        let row: Option<Uuid> = sqlx::query_scalar("SELECT id FROM runs WHERE start_idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn persist_node_states(&self, run_id: Uuid, node_states: serde_json::Value) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE runs SET node_states = $1 WHERE id = $2")
            .bind(&node_states)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
