//! The Scheduler: a pure function from `(workflow, node-state
//! map, step history, current clock)` to next actions. Holds no state of
//! its own and talks to neither the Store nor the Bus — the `RunCoordinator`
//! is the only thing that persists or publishes what the Scheduler decides.
//!
//! Split into two entry points matching the overview's data flow
//! ("RunCoordinator applies result → Scheduler advances"):
//!
//!   - [`Scheduler::apply_step_outcome`] folds one just-arrived
//!     [`StepOutcome`] into the node-state map: Succeeded, retry-or-fail,
//!     Cancelled, TimedOut.
//!   - [`Scheduler::advance`] recomputes the Ready/Skipped frontier for
//!     every Pending node, emits `Dispatch` for nodes clear to run now, and
//!     detects run completion.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use nodes::contract::{idempotency_key, FailureKind, NodePolicy, StepExec, StepOutcome};
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Edge, NodeState, NodeStateMap, Step, Workflow};

/// One decision the coordinator must act on.
#[derive(Debug, Clone)]
pub enum Action {
    /// A step is clear to run now; hand it to the Dispatcher.
    Dispatch(StepExec),
    /// Nothing to dispatch right now, but a retry becomes due at this time —
    /// the coordinator should wake itself (via its inbox `select!`) no later
    /// than this instant even without a new inbound message.
    WakeAt(DateTime<Utc>),
    /// A critical node failed (or exhausted retries); the run must
    /// transition to Failed.
    FailRun { reason: String },
    /// A retryable failure is within budget; the next attempt is due after
    /// `after_ms`. Purely informational for the coordinator — it emits
    /// `step.retry_scheduled` and otherwise just waits for `advance` to
    /// re-promote the node once the backoff elapses.
    RetryScheduled { node_id: String, attempt: u32, after_ms: u64 },
    /// Every node has resolved to a terminal state and none failed
    /// critically; the run must transition to Succeeded.
    FinishRun,
}

pub struct Scheduler;

impl Scheduler {
    /// Fold a just-arrived [`StepOutcome`] for `(node_id, attempt)` into the
    /// node-state map. `attempts_so_far` is the number of step rows now
    /// recorded for this node (including the one this outcome belongs to).
    /// Returns the updated node states, updated outputs (with the node's
    /// output added on success), and — if the failure is run-fatal — the
    /// `FailRun` action.
    pub fn apply_step_outcome(
        workflow: &Workflow,
        mut node_states: NodeStateMap,
        mut outputs: HashMap<String, Value>,
        node_id: &str,
        attempts_so_far: u32,
        outcome: &StepOutcome,
    ) -> (NodeStateMap, HashMap<String, Value>, Option<Action>) {
        let node = workflow.node(node_id);
        let policy = node.map(|n| n.policy.clone()).unwrap_or_default();

        match outcome {
            StepOutcome::Succeeded { output, wait_token } => {
                if wait_token.is_some() {
                    node_states.insert(node_id.to_string(), NodeState::Waiting);
                } else {
                    node_states.insert(node_id.to_string(), NodeState::Succeeded);
                    outputs.insert(node_id.to_string(), output.clone());
                }
                (node_states, outputs, None)
            }
            StepOutcome::Cancelled => {
                node_states.insert(node_id.to_string(), NodeState::Cancelled);
                (node_states, outputs, None)
            }
            StepOutcome::TimedOut => {
                Self::fail_or_retry(node_states, outputs, node_id, attempts_so_far, &policy, true)
            }
            StepOutcome::Failed { retryable, .. } => {
                Self::fail_or_retry(node_states, outputs, node_id, attempts_so_far, &policy, *retryable)
            }
        }
    }

    fn fail_or_retry(
        mut node_states: NodeStateMap,
        outputs: HashMap<String, Value>,
        node_id: &str,
        attempts_so_far: u32,
        policy: &NodePolicy,
        retryable: bool,
    ) -> (NodeStateMap, HashMap<String, Value>, Option<Action>) {
        let retries_remaining = retryable && attempts_so_far <= policy.max_retries;
        if retries_remaining {
            // Back to Pending — `advance` will re-promote to Ready once the
            // backoff computed from step history has elapsed.
            node_states.insert(node_id.to_string(), NodeState::Pending);
            let after_ms = backoff_for(policy, attempts_so_far).as_millis() as u64;
            let action = Action::RetryScheduled { node_id: node_id.to_string(), attempt: attempts_so_far + 1, after_ms };
            return (node_states, outputs, Some(action));
        }

        node_states.insert(node_id.to_string(), NodeState::Failed);

        if policy.critical {
            let reason = format!("node '{node_id}' failed fatally after {attempts_so_far} attempt(s)");
            return (node_states, outputs, Some(Action::FailRun { reason }));
        }

        (node_states, outputs, None)
    }

    /// Recompute the Ready/Skipped frontier and emit actions for the current
    /// instant. Idempotent: calling it twice with the same inputs yields the
    /// same result.
    pub fn advance(
        workflow: &Workflow,
        run_id: Uuid,
        tenant_id: &str,
        mut node_states: NodeStateMap,
        outputs: &HashMap<String, Value>,
        trigger_payload: &Value,
        step_history: &[Step],
        now: DateTime<Utc>,
    ) -> (NodeStateMap, Vec<Action>) {
        // Fixed point: a node's resolution can unblock its successor in the
        // same pass, so iterate until nothing changes (bounded by node
        // count — DAGs have no cycles so this always converges).
        loop {
            let mut changed = false;
            for node in &workflow.nodes {
                if node_states.get(node.id.as_str()).copied().unwrap_or(NodeState::Pending) != NodeState::Pending {
                    continue;
                }
                if let Some(new_state) = resolve_pending_node(workflow, node.id.as_str(), &node_states, outputs) {
                    node_states.insert(node.id.clone(), new_state);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut actions = Vec::new();
        let mut wake_at: Option<DateTime<Utc>> = None;

        let mut ready_nodes: Vec<&crate::models::NodeDefinition> = workflow
            .nodes
            .iter()
            .filter(|n| node_states.get(n.id.as_str()).copied() == Some(NodeState::Ready))
            .collect();
        // Tie-break: higher priority first, then lexicographic node id.
        ready_nodes.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        for node in ready_nodes {
            let history: Vec<&Step> = step_history.iter().filter(|s| s.node_id == node.id).collect();
            let attempt = history.len() as u32 + 1;

            if let Some(last) = history.iter().max_by_key(|s| s.attempt) {
                if last.state == NodeState::Failed {
                    if let Some(finished_at) = last.finished_at {
                        let not_before = finished_at + chrono::Duration::from_std(backoff_for(&node.policy, last.attempt)).unwrap_or_default();
                        if now < not_before {
                            wake_at = Some(wake_at.map_or(not_before, |w: DateTime<Utc>| w.min(not_before)));
                            continue;
                        }
                    }
                }
            }

            node_states.insert(node.id.clone(), NodeState::Dispatched);
            let key = idempotency_key(run_id, &node.id, attempt);
            let input = resolve_input(workflow, &node.id, outputs, trigger_payload);
            let cancellation_token = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
            actions.push(Action::Dispatch(StepExec {
                run_id,
                node_id: node.id.clone(),
                attempt,
                idempotency_key: key,
                node_type: node.node_type.clone(),
                params: node.config.clone(),
                input,
                policy: node.policy.clone(),
                trace_id: run_id.to_string(),
                cancellation_token,
            }));
        }

        if let Some(wake) = wake_at {
            actions.push(Action::WakeAt(wake));
        }

        let any_unresolved = workflow.nodes.iter().any(|n| {
            matches!(
                node_states.get(n.id.as_str()).copied().unwrap_or(NodeState::Pending),
                NodeState::Pending | NodeState::Ready | NodeState::Dispatched | NodeState::Waiting
            )
        });
        let any_critical_failure = workflow.nodes.iter().any(|n| {
            node_states.get(n.id.as_str()).copied() == Some(NodeState::Failed) && n.policy.critical
        });

        if !any_unresolved {
            if any_critical_failure {
                actions.push(Action::FailRun { reason: "critical node failed".into() });
            } else if !actions.iter().any(|a| matches!(a, Action::FailRun { .. })) {
                actions.push(Action::FinishRun);
            }
        }

        let _ = tenant_id; // reserved: fairness across runs is applied by the caller round-robining coordinators, not here
        (node_states, actions)
    }
}

/// Whether every incoming edge of `node_id` has resolved, and if so, what
/// the node's new state should be. Returns `None` if at least one predecessor hasn't
/// reached a terminal state yet.
fn resolve_pending_node(
    workflow: &Workflow,
    node_id: &str,
    node_states: &NodeStateMap,
    outputs: &HashMap<String, Value>,
) -> Option<NodeState> {
    let incoming: Vec<&Edge> = workflow.incoming_edges(node_id).collect();
    if incoming.is_empty() {
        return Some(NodeState::Ready);
    }

    let mut any_active = false;
    let mut all_satisfied = true;

    for edge in &incoming {
        let producer_state = node_states.get(edge.from.as_str()).copied().unwrap_or(NodeState::Pending);
        match producer_state {
            NodeState::Succeeded => {
                let active = match &edge.guard {
                    Some(guard) => outputs.get(&edge.from).map(|out| guard.evaluate(out)).unwrap_or(false),
                    None => true,
                };
                any_active |= active;
            }
            NodeState::Skipped => {
                // Satisfies the dependency but never activates the edge.
            }
            NodeState::Failed | NodeState::Cancelled => {
                all_satisfied = false;
            }
            NodeState::Pending | NodeState::Ready | NodeState::Dispatched | NodeState::Waiting => {
                return None;
            }
        }
    }

    if !all_satisfied {
        return Some(NodeState::Skipped);
    }
    Some(if any_active { NodeState::Ready } else { NodeState::Skipped })
}

/// Resolve a node's input by merging predecessor outputs under their node
/// id, plus the run's trigger payload for entry nodes.
fn resolve_input(workflow: &Workflow, node_id: &str, outputs: &HashMap<String, Value>, trigger_payload: &Value) -> Value {
    let mut map = serde_json::Map::new();
    let mut any_predecessor = false;
    for edge in workflow.incoming_edges(node_id) {
        any_predecessor = true;
        if let Some(output) = outputs.get(&edge.from) {
            map.insert(edge.from.clone(), output.clone());
        }
    }
    if !any_predecessor {
        map.insert("trigger".to_string(), trigger_payload.clone());
    }
    Value::Object(map)
}

/// `base × 2^(attempt-1)`, capped, plus uniform jitter in `[0, jitter]`.
fn backoff_for(policy: &NodePolicy, failed_attempt: u32) -> StdDuration {
    let base_ms = policy.retry_base_ms;
    let exp = failed_attempt.saturating_sub(1).min(20); // guard against overflow on pathological policies
    let scaled = base_ms.saturating_mul(1u64 << exp);
    let capped = scaled.min(policy.retry_cap_ms);
    let jitter = if policy.retry_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.retry_jitter_ms)
    } else {
        0
    };
    StdDuration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeDefinition, Trigger};
    use chrono::Duration;

    fn node(id: &str, critical: bool) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            node_type: "mock".into(),
            config: Value::Null,
            policy: NodePolicy { critical, ..Default::default() },
            priority: 0,
        }
    }

    fn workflow(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Workflow {
        Workflow::new("wf", Trigger::Manual, nodes, edges)
    }

    #[test]
    fn entry_node_becomes_ready_and_dispatches() {
        let wf = workflow(vec![node("a", true)], vec![]);
        let states: NodeStateMap = [("a".to_string(), NodeState::Pending)].into_iter().collect();
        let (states, actions) =
            Scheduler::advance(&wf, Uuid::new_v4(), "t1", states, &HashMap::new(), &Value::Null, &[], Utc::now());
        assert_eq!(states["a"], NodeState::Dispatched);
        assert!(matches!(actions[0], Action::Dispatch(_)));
    }

    #[test]
    fn downstream_ready_only_after_predecessor_succeeds() {
        let wf = workflow(
            vec![node("a", true), node("b", true)],
            vec![Edge { from: "a".into(), to: "b".into(), guard: None }],
        );
        let states: NodeStateMap =
            [("a".to_string(), NodeState::Succeeded), ("b".to_string(), NodeState::Pending)].into_iter().collect();
        let outputs: HashMap<String, Value> = [("a".to_string(), serde_json::json!({"ok": true}))].into_iter().collect();
        let (states, actions) =
            Scheduler::advance(&wf, Uuid::new_v4(), "t1", states, &outputs, &Value::Null, &[], Utc::now());
        assert_eq!(states["b"], NodeState::Dispatched);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn guard_false_skips_downstream() {
        let wf = workflow(
            vec![node("a", true), node("b", false)],
            vec![Edge {
                from: "a".into(),
                to: "b".into(),
                guard: Some(crate::models::Guard { field: "ok".into(), equals: Some(serde_json::json!(true)), exists: None }),
            }],
        );
        let states: NodeStateMap =
            [("a".to_string(), NodeState::Succeeded), ("b".to_string(), NodeState::Pending)].into_iter().collect();
        let outputs: HashMap<String, Value> = [("a".to_string(), serde_json::json!({"ok": false}))].into_iter().collect();
        let (states, actions) =
            Scheduler::advance(&wf, Uuid::new_v4(), "t1", states, &outputs, &Value::Null, &[], Utc::now());
        assert_eq!(states["b"], NodeState::Skipped);
        assert!(actions.iter().any(|a| matches!(a, Action::FinishRun)));
    }

    #[test]
    fn exhausted_non_critical_failure_skips_dependents_and_finishes() {
        let wf = workflow(
            vec![node("a", false), node("b", false)],
            vec![Edge { from: "a".into(), to: "b".into(), guard: None }],
        );
        let states: NodeStateMap =
            [("a".to_string(), NodeState::Dispatched), ("b".to_string(), NodeState::Pending)].into_iter().collect();
        let outcome = StepOutcome::Failed { kind: FailureKind::Transient, message: "boom".into(), retryable: true };
        // max_retries default 3; attempt 4 exhausts.
        let (states, outputs, action) =
            Scheduler::apply_step_outcome(&wf, states, HashMap::new(), "a", 4, &outcome);
        assert_eq!(states["a"], NodeState::Failed);
        assert!(action.is_none());

        let (states, actions) =
            Scheduler::advance(&wf, Uuid::new_v4(), "t1", states, &outputs, &Value::Null, &[], Utc::now());
        assert_eq!(states["b"], NodeState::Skipped);
        assert!(actions.iter().any(|a| matches!(a, Action::FinishRun)));
    }

    #[test]
    fn critical_failure_fails_the_run() {
        let wf = workflow(vec![node("a", true)], vec![]);
        let states: NodeStateMap = [("a".to_string(), NodeState::Dispatched)].into_iter().collect();
        let outcome = StepOutcome::Failed { kind: FailureKind::Validation, message: "bad".into(), retryable: false };
        let (states, _outputs, action) = Scheduler::apply_step_outcome(&wf, states, HashMap::new(), "a", 1, &outcome);
        assert_eq!(states["a"], NodeState::Failed);
        assert!(matches!(action, Some(Action::FailRun { .. })));
    }

    #[test]
    fn retryable_failure_under_budget_returns_to_pending_not_failed() {
        let wf = workflow(vec![node("a", true)], vec![]);
        let states: NodeStateMap = [("a".to_string(), NodeState::Dispatched)].into_iter().collect();
        let outcome = StepOutcome::Failed { kind: FailureKind::Transient, message: "boom".into(), retryable: true };
        let (states, _outputs, action) = Scheduler::apply_step_outcome(&wf, states, HashMap::new(), "a", 1, &outcome);
        assert_eq!(states["a"], NodeState::Pending);
        assert!(matches!(action, Some(Action::RetryScheduled { attempt: 2, .. })));
    }

    #[test]
    fn retry_backoff_delays_redispatch() {
        let wf = workflow(vec![node("a", true)], vec![]);
        let states: NodeStateMap = [("a".to_string(), NodeState::Pending)].into_iter().collect();
        let now = Utc::now();
        let failed_step = Step {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: "a".into(),
            attempt: 1,
            state: NodeState::Failed,
            queued_at: now - Duration::seconds(1),
            started_at: Some(now - Duration::seconds(1)),
            finished_at: Some(now),
            input: Value::Null,
            output: None,
            error: Some("boom".into()),
            duration_ms: Some(5),
            idempotency_key: "k".into(),
        };
        let (states, actions) = Scheduler::advance(
            &wf,
            Uuid::new_v4(),
            "t1",
            states,
            &HashMap::new(),
            &Value::Null,
            &[failed_step],
            now,
        );
        // Still Pending — backoff (default 100ms base) hasn't elapsed.
        assert_eq!(states["a"], NodeState::Pending);
        assert!(actions.iter().any(|a| matches!(a, Action::WakeAt(_))));
    }
}
