//! Core domain models for the workflow engine.
//!
//! `Workflow`/`NodeDefinition`/`Edge` describe the immutable graph.
//! `Run`/`Step` and the state enums describe one execution of it. These are
//! in-memory domain types; `db::models::RunRow`/`StepRow` are their
//! persistence-layer counterparts (opaque JSON/strings so `db` doesn't
//! depend on `engine`) — conversions between the two live at the bottom of
//! this module.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nodes::contract::NodePolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Triggered by an incoming HTTP request to `/webhook/{path}`.
    Webhook {
        /// URL path segment that identifies this workflow.
        path: String,
    },
    /// Triggered manually via the REST API.
    Manual,
    /// Triggered on a cron schedule.
    Cron {
        /// Standard cron expression (5 fields).
        expression: String,
    },
}

// ---------------------------------------------------------------------------
// Guard — edge-level predicate over the producer's output
// ---------------------------------------------------------------------------

/// A small JSON-predicate matcher rather than a general expression
/// language: field-equality or field-existence over the producer node's
/// output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guard {
    pub field: String,
    /// The edge is active iff the field equals this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// The edge is active iff the field is present (`true`) or absent
    /// (`false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl Guard {
    /// Evaluate this guard against the producer's output. A guard with
    /// neither `equals` nor `exists` set always evaluates true.
    pub fn evaluate(&self, producer_output: &Value) -> bool {
        let field_value = producer_output.get(&self.field);
        if let Some(expected) = &self.equals {
            return field_value == Some(expected);
        }
        if let Some(want_exists) = self.exists {
            return field_value.is_some() == want_exists;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to a registered `ExecutableNode` implementation.
    pub node_type: String,
    /// Arbitrary configuration passed to the node at execution time.
    pub config: serde_json::Value,
    /// Timeout/retry/egress/resource policy for this node.
    #[serde(default)]
    pub policy: NodePolicy,
    /// Tie-break order when multiple nodes are simultaneously Ready — higher
    /// runs first.
    #[serde(default)]
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge from one node to another, optionally guarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete, immutable (per version) workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub version: i32,
    pub name: String,
    pub trigger: Trigger,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        nodes: Vec<NodeDefinition>,
        edges: Vec<Edge>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            trigger,
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Edges whose `to` field names `node_id`.
    pub fn incoming_edges(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    /// Nodes with no incoming edges — the entry set.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| self.incoming_edges(id).next().is_none())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RunState / NodeState
// ---------------------------------------------------------------------------

/// Run-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    /// No node ready, at least one long-running async step outstanding.
    Waiting,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Waiting => "waiting",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RunState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            "waiting" => Self::Waiting,
            other => return Err(format!("unknown run state: {other}")),
        })
    }
}

/// Per-node state within a run's node-state map. `Waiting` is a
/// supplement for async nodes holding a wait token, required by the
/// async-node mechanism it itself describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Dispatched,
    Waiting,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Waiting => "waiting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NodeState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "dispatched" => Self::Dispatched,
            "waiting" => Self::Waiting,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown node state: {other}")),
        })
    }
}

pub type NodeStateMap = HashMap<String, NodeState>;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution of a workflow against a trigger payload.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub tenant_id: String,
    pub trigger_payload: Value,
    pub priority: i32,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub node_states: NodeStateMap,
    /// Succeeded nodes' outputs, used to resolve a downstream node's input
    /// and to evaluate guards. Reconstructed from step history on recovery
    /// — not itself part of the persisted node-state map.
    pub outputs: HashMap<String, Value>,
}

impl Run {
    pub fn new(
        workflow: &Workflow,
        tenant_id: String,
        trigger_payload: Value,
        priority: i32,
    ) -> Self {
        let node_states = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::Pending))
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            tenant_id,
            trigger_payload,
            priority,
            state: RunState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            node_states,
            outputs: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One attempt to execute one node within one run.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub state: NodeState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub idempotency_key: String,
}

// ---------------------------------------------------------------------------
// Conversions to/from the db crate's opaque persistence rows
// ---------------------------------------------------------------------------

impl Run {
    pub fn to_row(&self, start_idempotency_key: Option<String>) -> db::models::RunRow {
        let node_states = serde_json::to_value(
            self.node_states
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect::<HashMap<String, String>>(),
        )
        .expect("NodeStateMap always serializes");

        db::models::RunRow {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            tenant_id: self.tenant_id.clone(),
            trigger_payload: self.trigger_payload.clone(),
            priority: self.priority,
            state: self.state.to_string(),
            node_states,
            failure_reason: self.failure_reason.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            start_idempotency_key,
            lease_owner: None,
            lease_expiry: None,
        }
    }

    /// Rebuild a `Run` from its persisted row plus every step recorded for
    /// it (used on coordinator recovery).
    pub fn from_row(row: db::models::RunRow, steps: &[Step]) -> Self {
        let raw_states: HashMap<String, String> =
            serde_json::from_value(row.node_states).unwrap_or_default();
        let node_states = raw_states
            .into_iter()
            .map(|(k, v)| (k.clone(), NodeState::from_str(&v).unwrap_or(NodeState::Pending)))
            .collect();

        let mut outputs = HashMap::new();
        for step in steps {
            if step.state == NodeState::Succeeded {
                if let Some(output) = &step.output {
                    outputs.insert(step.node_id.clone(), output.clone());
                }
            }
        }

        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            workflow_version: row.workflow_version,
            tenant_id: row.tenant_id,
            trigger_payload: row.trigger_payload,
            priority: row.priority,
            state: RunState::from_str(&row.state).unwrap_or(RunState::Pending),
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            failure_reason: row.failure_reason,
            node_states,
            outputs,
        }
    }

    pub fn node_states_json(&self) -> Value {
        serde_json::to_value(
            self.node_states
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect::<HashMap<String, String>>(),
        )
        .expect("NodeStateMap always serializes")
    }
}

impl Step {
    pub fn to_row(&self) -> db::models::StepRow {
        db::models::StepRow {
            id: self.id,
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            attempt: self.attempt as i32,
            state: self.state.to_string(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms.map(|d| d as i64),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn from_row(row: db::models::StepRow) -> Self {
        Self {
            id: row.id,
            run_id: row.run_id,
            node_id: row.node_id,
            attempt: row.attempt as u32,
            state: NodeState::from_str(&row.state).unwrap_or(NodeState::Dispatched),
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            input: row.input,
            output: row.output,
            error: row.error,
            duration_ms: row.duration_ms.map(|d| d as u64),
            idempotency_key: row.idempotency_key,
        }
    }
}
