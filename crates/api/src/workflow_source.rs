//! Resolves a workflow id/version to its immutable definition for the
//! engine crate, which never depends on `db`'s `workflows` table directly.

use std::sync::Arc;

use engine::{EngineError, Workflow, WorkflowSource};
use sqlx::PgPool;
use uuid::Uuid;

pub struct PgWorkflowSource {
    pool: PgPool,
}

impl PgWorkflowSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkflowSource for PgWorkflowSource {
    async fn load(&self, workflow_id: Uuid, _version: i32) -> Result<Arc<Workflow>, EngineError> {
        // The `workflows` table has no version column (DESIGN.md): one row
        // per id, always version 1.
        let row = db::repository::workflows::get_workflow(&self.pool, workflow_id)
            .await
            .map_err(EngineError::Database)?;
        let workflow: Workflow = serde_json::from_value(row.definition)
            .map_err(|e| EngineError::ContractViolation(format!("stored workflow definition is invalid: {e}")))?;
        Ok(Arc::new(workflow))
    }
}
