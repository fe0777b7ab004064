//! Wire format and semantics the sandboxed runner must honour.
//!
//! These types are the execution-plane side of the runner contract: what
//! the Dispatcher sends on the work queue, and what it expects back. The
//! sandbox implementation itself is an external collaborator — this module
//! only fixes the envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Stable token for (run id, node id, attempt number). The Store records
/// completion against this key before a result becomes observable.
pub type IdempotencyKey = String;

/// Build the canonical idempotency key for an attempt.
pub fn idempotency_key(run_id: Uuid, node_id: &str, attempt: u32) -> IdempotencyKey {
    format!("{run_id}:{node_id}:{attempt}")
}

/// Per-node policy: timeout, retries, egress, and resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePolicy {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_jitter_ms: u64,
    /// Hosts the node is allowed to reach; empty means unrestricted.
    pub allowed_egress_hosts: Vec<String>,
    pub resource_limits: ResourceLimits,
    /// When false, a fatal failure of this node does not fail the run;
    /// dependents are Skipped instead.
    pub critical: bool,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            retry_base_ms: 100,
            retry_cap_ms: 30_000,
            retry_jitter_ms: 50,
            allowed_egress_hosts: Vec::new(),
            resource_limits: ResourceLimits::default(),
            critical: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: Option<u64>,
    pub cpu_millis: Option<u64>,
}

/// Envelope sent from Dispatcher to Runner on `step.exec.<class>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExec {
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
    pub node_type: String,
    pub params: Value,
    pub input: Value,
    pub policy: NodePolicy,
    pub trace_id: String,
    pub cancellation_token: Uuid,
}

/// Classification of a failed outcome, independent of the `retryable` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Store/Bus/network blip — retried internally, never surfaced alone.
    Transient,
    /// 4xx-style validation / contract violation from the node's own logic.
    Validation,
    /// Malformed runner response or unknown node type.
    Contract,
    Unknown,
}

/// Final disposition of one step attempt, as reported by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        output: Value,
        /// Present when the node is async/long-running; the coordinator
        /// parks the node in Waiting until an external wake redeems it.
        wait_token: Option<String>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
    Cancelled,
    TimedOut,
}

/// Envelope sent from Runner back to Dispatcher on `step.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
    pub outcome: StepOutcome,
    pub observed_duration_ms: u64,
    pub attachment_refs: Vec<String>,
}

impl StepResult {
    pub fn succeeded(exec: &StepExec, output: Value, duration_ms: u64) -> Self {
        Self {
            run_id: exec.run_id,
            node_id: exec.node_id.clone(),
            attempt: exec.attempt,
            idempotency_key: exec.idempotency_key.clone(),
            outcome: StepOutcome::Succeeded { output, wait_token: None },
            observed_duration_ms: duration_ms,
            attachment_refs: Vec::new(),
        }
    }

    pub fn failed(exec: &StepExec, kind: FailureKind, message: String, retryable: bool, duration_ms: u64) -> Self {
        Self {
            run_id: exec.run_id,
            node_id: exec.node_id.clone(),
            attempt: exec.attempt,
            idempotency_key: exec.idempotency_key.clone(),
            outcome: StepOutcome::Failed { kind, message, retryable },
            observed_duration_ms: duration_ms,
            attachment_refs: Vec::new(),
        }
    }

    pub fn cancelled(exec: &StepExec) -> Self {
        Self {
            run_id: exec.run_id,
            node_id: exec.node_id.clone(),
            attempt: exec.attempt,
            idempotency_key: exec.idempotency_key.clone(),
            outcome: StepOutcome::Cancelled,
            observed_duration_ms: 0,
            attachment_refs: Vec::new(),
        }
    }

    pub fn timed_out(exec: &StepExec, duration_ms: u64) -> Self {
        Self {
            run_id: exec.run_id,
            node_id: exec.node_id.clone(),
            attempt: exec.attempt,
            idempotency_key: exec.idempotency_key.clone(),
            outcome: StepOutcome::TimedOut,
            observed_duration_ms: duration_ms,
            attachment_refs: Vec::new(),
        }
    }
}

/// Best-effort cancellation request for one outstanding attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
}

/// An external wake redeeming a wait token for an async node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalWake {
    pub wait_token: String,
    pub outcome: StepOutcome,
}

/// Convenience alias for decrypted secret maps passed through `ExecutionContext`.
pub type SecretMap = HashMap<String, String>;
