//! `LocalRunner` — an in-process stand-in for the sandboxed runner.
//!
//! The real runner is an external collaborator: a sandboxed
//! process reached over the work queue. `LocalRunner` implements the same
//! wire contract in-process, against the built-in [`NodeRegistry`], so the
//! rest of the execution plane (Dispatcher, Scheduler, RunCoordinator) can be
//! exercised end-to-end in tests and local development without standing up a
//! real sandbox.

use std::collections::HashMap;
use std::time::Instant;

use tracing::warn;

use crate::contract::{FailureKind, StepExec, StepOutcome, StepResult};
use crate::error::NodeError;
use crate::registry::NodeRegistry;
use crate::traits::ExecutionContext;

/// Runs a [`StepExec`] against an in-process [`NodeRegistry`] and produces
/// the [`StepResult`] a real sandboxed runner would have sent back.
pub struct LocalRunner {
    registry: NodeRegistry,
}

impl LocalRunner {
    pub fn new(registry: NodeRegistry) -> Self {
        Self { registry }
    }

    /// Execute one attempt. Never panics: an unknown node type or node-level
    /// error is translated into the matching `StepOutcome` rather than
    /// propagated, exactly as a real runner's response would be.
    pub async fn execute(&self, exec: StepExec, secrets: HashMap<String, String>) -> StepResult {
        let started = Instant::now();

        let Some(node) = self.registry.get(&exec.node_type) else {
            warn!(node_type = %exec.node_type, "no implementation registered for node type");
            return StepResult::failed(
                &exec,
                FailureKind::Contract,
                format!("unknown node type '{}'", exec.node_type),
                false,
                elapsed_ms(started),
            );
        };

        let ctx = ExecutionContext {
            workflow_id: exec.run_id, // workflow identity is carried by the run snapshot upstream
            execution_id: exec.run_id,
            input: exec.input.clone(),
            secrets,
            policy: exec.policy.clone(),
        };

        match node.execute(exec.params.clone(), exec.input.clone(), &ctx).await {
            Ok(output) => StepResult::succeeded(&exec, output, elapsed_ms(started)),
            Err(NodeError::Fatal(message)) => StepResult::failed(
                &exec,
                FailureKind::Validation,
                message,
                false,
                elapsed_ms(started),
            ),
            Err(NodeError::Retryable(message)) => StepResult::failed(
                &exec,
                FailureKind::Transient,
                message,
                true,
                elapsed_ms(started),
            ),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::NodePolicy;
    use crate::registry::builtin_registry;
    use serde_json::json;
    use uuid::Uuid;

    fn make_exec(node_type: &str, params: serde_json::Value) -> StepExec {
        StepExec {
            run_id: Uuid::new_v4(),
            node_id: "n1".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            node_type: node_type.into(),
            params,
            input: json!({}),
            policy: NodePolicy::default(),
            trace_id: "t".into(),
            cancellation_token: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn unknown_node_type_is_a_contract_failure() {
        let runner = LocalRunner::new(builtin_registry());
        let result = runner.execute(make_exec("nonexistent", json!({})), HashMap::new()).await;
        match result.outcome {
            StepOutcome::Failed { kind, retryable, .. } => {
                assert_eq!(kind, FailureKind::Contract);
                assert!(!retryable);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transform_node_succeeds() {
        let runner = LocalRunner::new(builtin_registry());
        let exec = make_exec("transform", json!({ "set": { "x": 1 } }));
        let result = runner.execute(exec, HashMap::new()).await;
        assert!(matches!(result.outcome, StepOutcome::Succeeded { .. }));
    }
}
