//! Workflow definition storage. Creation and lookup only — editing,
//! versioning, and listing-for-its-own-sake are authoring-UI concerns the
//! execution plane doesn't own.
//!
//! The `workflows` table has no version column: each id names exactly one
//! immutable definition, so `engine::models::Workflow::version` is always 1
//! for anything loaded through this repository (see `DESIGN.md`).

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::WorkflowRow, DbError};

/// Insert a new workflow. `definition` must be a JSON-serialized
/// `engine::models::Workflow`.
pub async fn create_workflow(
    pool: &PgPool,
    name: &str,
    definition: serde_json::Value,
) -> Result<WorkflowRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let row = sqlx::query_as!(
        WorkflowRow,
        r#"
        INSERT INTO workflows (id, name, definition, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, definition, created_at
        "#,
        id,
        name,
        definition,
        now,
    )
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as!(
        WorkflowRow,
        r#"SELECT id, name, definition, created_at FROM workflows WHERE id = $1"#,
        id,
    )
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Every stored workflow, newest first. Used by webhook ingress to resolve a
/// trigger path to a workflow id — not exposed
/// as a public listing endpoint.
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as!(
        WorkflowRow,
        r#"SELECT id, name, definition, created_at FROM workflows ORDER BY created_at DESC"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
