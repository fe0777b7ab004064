//! End-to-end coordinator tests: a real `RunCoordinator`/`Supervisor` wired
//! against an in-memory `Store` and `Bus`, with a background loop standing
//! in for the sandboxed runner. Unlike `scheduler::tests`, these exercise
//! persistence, dispatch, and recovery together rather than the pure
//! fan-out function alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db::{InMemoryStore, Store};
use nodes::{builtin_registry, ExecutableNode, ExecutionContext, LocalRunner, NodeError};
use queue::{Bus, InMemoryBus};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorMessage, Supervisor, WorkflowSource};
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::BusEventPublisher;
use crate::models::{Edge, NodeDefinition, Run, Trigger, Workflow};
use crate::rate_limiter::RateLimiter;

struct StaticWorkflowSource(Arc<Workflow>);

#[async_trait]
impl WorkflowSource for StaticWorkflowSource {
    async fn load(&self, _workflow_id: Uuid, _version: i32) -> Result<Arc<Workflow>, EngineError> {
        Ok(self.0.clone())
    }
}

fn node(id: &str, node_type: &str) -> NodeDefinition {
    NodeDefinition {
        id: id.to_string(),
        node_type: node_type.to_string(),
        config: json!({}),
        policy: nodes::contract::NodePolicy::default(),
        priority: 0,
    }
}

fn edge(from: &str, to: &str) -> Edge {
    Edge { from: from.to_string(), to: to.to_string(), guard: None }
}

/// a -> b -> c, all `transform` nodes so the built-in registry can run them.
fn linear_workflow() -> Workflow {
    Workflow::new(
        "linear",
        Trigger::Manual,
        vec![node("a", "transform"), node("b", "transform"), node("c", "transform")],
        vec![edge("a", "b"), edge("b", "c")],
    )
}

struct Harness {
    store: Arc<InMemoryStore>,
    bus: Arc<InMemoryBus>,
    dispatcher: Arc<Dispatcher<InMemoryBus>>,
    supervisor: Arc<Supervisor<InMemoryStore, InMemoryBus>>,
    workflow: Arc<Workflow>,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        default_run_timeout: Duration::from_secs(10),
        coordinator_lease: Duration::from_millis(200),
        lease_renew_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

/// Wires a coordinator stack around `workflow`, with one background worker
/// loop per entry in `registry` draining the bus and executing via
/// `LocalRunner`, publishing the result back — the in-process stand-in for
/// the sandboxed runner.
fn harness(workflow: Workflow, registry: nodes::NodeRegistry, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(1000.0, 1000, 1000.0, 1000));
    let publisher: Arc<dyn crate::events::EventPublisher> = Arc::new(BusEventPublisher::new(bus.clone()));
    let workflow = Arc::new(workflow);
    let workflow_source: Arc<dyn WorkflowSource> = Arc::new(StaticWorkflowSource(workflow.clone()));

    let supervisor = Arc::new(Supervisor::new(
        "test-owner".to_string(),
        store.clone(),
        dispatcher.clone(),
        rate_limiter,
        publisher,
        config,
        workflow_source,
    ));

    tokio::spawn(dispatcher.clone().run_result_consumer());
    tokio::spawn(dispatcher.clone().run_timeout_reaper());

    let node_types: Vec<String> = registry.keys().cloned().collect();
    let runner = Arc::new(LocalRunner::new(registry));
    let mut workers = Vec::new();
    for node_type in node_types {
        let bus = bus.clone();
        let runner = runner.clone();
        workers.push(tokio::spawn(async move {
            loop {
                match bus.next_exec(&node_type).await {
                    Ok(Some(exec)) => {
                        let result = runner.execute(exec, HashMap::new()).await;
                        let _ = bus.publish_result(result).await;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        }));
    }

    Harness { store, bus, dispatcher, supervisor, workflow, _workers: workers }
}

async fn wait_for_terminal(store: &InMemoryStore, run_id: Uuid) -> db::models::RunRow {
    for _ in 0..200 {
        let (row, _) = store.load_run(run_id).await.unwrap();
        if matches!(row.state.as_str(), "succeeded" | "failed" | "cancelled" | "timed_out") {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} never reached a terminal state");
}

// ---------------------------------------------------------------------------
// S1 — linear DAG, all nodes succeed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_workflow_runs_every_node_to_completion() {
    let workflow = linear_workflow();
    let h = harness(workflow, builtin_registry(), fast_config());

    let run = Run::new(&h.workflow, "tenant-1".to_string(), json!({"amount": 7}), 0);
    let run_id = run.id;
    h.supervisor.spawn_new_run(run, h.workflow.clone(), None).await.unwrap();

    let row = wait_for_terminal(&h.store, run_id).await;
    assert_eq!(row.state, "succeeded");

    let (_, steps) = h.store.load_run(run_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.state == "succeeded"));
}

// ---------------------------------------------------------------------------
// S2 — a node fails transiently once, then succeeds on retry
// ---------------------------------------------------------------------------

struct FlakyOnceNode {
    calls: AtomicU32,
}

#[async_trait]
impl ExecutableNode for FlakyOnceNode {
    async fn execute(&self, _params: Value, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(NodeError::Retryable("transient upstream blip".to_string()))
        } else {
            Ok(input)
        }
    }
}

#[tokio::test]
async fn node_that_fails_once_succeeds_on_its_retry() {
    let mut registry = builtin_registry();
    registry.insert("flaky".to_string(), Arc::new(FlakyOnceNode { calls: AtomicU32::new(0) }) as Arc<dyn ExecutableNode>);

    let mut workflow = linear_workflow();
    workflow.nodes[0].node_type = "flaky".to_string();
    // Keep the retry backoff short so the test doesn't wait on the default cap.
    workflow.nodes[0].policy.retry_base_ms = 10;
    workflow.nodes[0].policy.retry_jitter_ms = 5;

    let h = harness(workflow, registry, fast_config());
    let run = Run::new(&h.workflow, "tenant-1".to_string(), json!({"amount": 1}), 0);
    let run_id = run.id;
    h.supervisor.spawn_new_run(run, h.workflow.clone(), None).await.unwrap();

    let row = wait_for_terminal(&h.store, run_id).await;
    assert_eq!(row.state, "succeeded");

    let (_, steps) = h.store.load_run(run_id).await.unwrap();
    let a_attempts: Vec<_> = steps.iter().filter(|s| s.node_id == "a").collect();
    assert_eq!(a_attempts.len(), 2);
    assert_eq!(a_attempts[0].state, "failed");
    assert_eq!(a_attempts[1].state, "succeeded");
}

// ---------------------------------------------------------------------------
// S4 — mid-flight cancellation
// ---------------------------------------------------------------------------

struct SlowNode(Duration);

#[async_trait]
impl ExecutableNode for SlowNode {
    async fn execute(&self, _params: Value, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        tokio::time::sleep(self.0).await;
        Ok(input)
    }
}

#[tokio::test]
async fn cancel_mid_flight_settles_the_run_without_waiting_on_the_slow_node() {
    let mut registry = builtin_registry();
    registry.insert(
        "slow".to_string(),
        Arc::new(SlowNode(Duration::from_secs(5))) as Arc<dyn ExecutableNode>,
    );

    let mut workflow = linear_workflow();
    workflow.nodes[0].node_type = "slow".to_string();

    let h = harness(workflow, registry, fast_config());
    let run = Run::new(&h.workflow, "tenant-1".to_string(), json!({}), 0);
    let run_id = run.id;
    h.supervisor.spawn_new_run(run, h.workflow.clone(), None).await.unwrap();

    // Wait until node "a" is actually dispatched before cancelling.
    let mut dispatched = false;
    for _ in 0..100 {
        let (row, _) = h.store.load_run(run_id).await.unwrap();
        let states: HashMap<String, String> = serde_json::from_value(row.node_states).unwrap();
        if states.get("a").map(String::as_str) == Some("dispatched") {
            dispatched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dispatched, "node a never reached Dispatched before the cancel window closed");

    let inbox = h.dispatcher.inbox(run_id).expect("run should still have a live coordinator");
    inbox.send(CoordinatorMessage::Cancel).await.unwrap();

    let row = tokio::time::timeout(Duration::from_secs(5), wait_for_terminal(&h.store, run_id))
        .await
        .expect("cancellation should settle the run long before the slow node would ever return");
    assert_eq!(row.state, "cancelled");
}

// ---------------------------------------------------------------------------
// S5 — duplicate step-result delivery is idempotent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_step_result_delivery_commits_exactly_once() {
    // No background worker here — this test drives the bus by hand so it
    // can redeliver the same result.
    let workflow = Arc::new(linear_workflow());
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(1000.0, 1000, 1000.0, 1000));
    let publisher: Arc<dyn crate::events::EventPublisher> = Arc::new(BusEventPublisher::new(bus.clone()));
    let workflow_source: Arc<dyn WorkflowSource> = Arc::new(StaticWorkflowSource(workflow.clone()));
    let supervisor = Supervisor::new(
        "test-owner".to_string(),
        store.clone(),
        dispatcher.clone(),
        rate_limiter,
        publisher,
        fast_config(),
        workflow_source,
    );

    tokio::spawn(dispatcher.clone().run_result_consumer());

    let run = Run::new(&workflow, "tenant-1".to_string(), json!({}), 0);
    let run_id = run.id;
    supervisor.spawn_new_run(run, workflow.clone(), None).await.unwrap();

    let exec = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Some(exec)) = bus.next_exec("transform").await {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let result = nodes::contract::StepResult::succeeded(&exec, json!({"ok": true}), 5);
    bus.publish_result(result.clone()).await.unwrap();
    // Redeliver — a real runner or the timeout reaper could plausibly send
    // the same attempt's result twice.
    bus.publish_result(result).await.unwrap();

    // Give the duplicate a moment to be routed and (correctly) ignored.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, steps) = store.load_run(run_id).await.unwrap();
    let a_attempts: Vec<_> = steps.iter().filter(|s| s.node_id == "a").collect();
    assert_eq!(a_attempts.len(), 1, "duplicate delivery must not produce a second step row");
    assert_eq!(a_attempts[0].state, "succeeded");
}

// ---------------------------------------------------------------------------
// S6 — coordinator crash and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_crashed_coordinators_run_is_resumed_by_recovery() {
    let mut registry = builtin_registry();
    registry.insert(
        "slow".to_string(),
        Arc::new(SlowNode(Duration::from_millis(300))) as Arc<dyn ExecutableNode>,
    );

    let mut workflow = linear_workflow();
    workflow.nodes[0].node_type = "slow".to_string();
    let workflow = Arc::new(workflow);

    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(1000.0, 1000, 1000.0, 1000));
    let publisher: Arc<dyn crate::events::EventPublisher> = Arc::new(BusEventPublisher::new(bus.clone()));
    let workflow_source: Arc<dyn WorkflowSource> = Arc::new(StaticWorkflowSource(workflow.clone()));
    let config = fast_config();
    let supervisor = Supervisor::new(
        "original-owner".to_string(),
        store.clone(),
        dispatcher.clone(),
        rate_limiter.clone(),
        publisher.clone(),
        config.clone(),
        workflow_source.clone(),
    );

    tokio::spawn(dispatcher.clone().run_result_consumer());
    tokio::spawn(dispatcher.clone().run_timeout_reaper());

    let run = Run::new(&workflow, "tenant-1".to_string(), json!({}), 0);
    let run_id = run.id;
    let original = supervisor.spawn_new_run(run, workflow.clone(), None).await.unwrap();

    // Wait for node "a" to reach Dispatched (and be persisted as such),
    // then kill the coordinator task outright — a clean stand-in for a
    // process crash.
    for _ in 0..100 {
        let (row, _) = store.load_run(run_id).await.unwrap();
        let states: HashMap<String, String> = serde_json::from_value(row.node_states).unwrap();
        if states.get("a").map(String::as_str) == Some("dispatched") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    original.abort();

    // Let the lease expire, then run a second supervisor's recovery scan —
    // modeling a fresh process reclaiming orphaned runs.
    tokio::time::sleep(config.coordinator_lease + Duration::from_millis(100)).await;

    let recovering_runner = Arc::new(LocalRunner::new(registry));
    let recovering_node_types = vec!["slow".to_string(), "transform".to_string()];
    for node_type in recovering_node_types {
        let bus = bus.clone();
        let runner = recovering_runner.clone();
        tokio::spawn(async move {
            loop {
                match bus.next_exec(&node_type).await {
                    Ok(Some(exec)) => {
                        let result = runner.execute(exec, HashMap::new()).await;
                        let _ = bus.publish_result(result).await;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        });
    }

    let recovering_supervisor = Supervisor::new(
        "recovering-owner".to_string(),
        store.clone(),
        dispatcher.clone(),
        Arc::new(RateLimiter::new(1000.0, 1000, 1000.0, 1000)),
        publisher,
        config,
        workflow_source,
    );
    let recovered = recovering_supervisor.recover_all().await.unwrap();
    assert_eq!(recovered, 1);

    let row = wait_for_terminal(&store, run_id).await;
    assert_eq!(row.state, "succeeded");

    // The slow node's original in-flight call eventually returns too, long
    // after the run is already terminal; it must not create a second
    // committed attempt.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let (_, steps) = store.load_run(run_id).await.unwrap();
    let a_attempts: Vec<_> = steps.iter().filter(|s| s.node_id == "a").collect();
    assert_eq!(a_attempts.len(), 1);
}
