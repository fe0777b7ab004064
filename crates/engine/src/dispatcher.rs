//! The Dispatcher: publishes a `StepExec` onto the work queue,
//! tracks its deadline, and forwards whatever comes back — a real
//! `StepResult`, a synthesized timeout, or a synthesized cancellation —
//! into the owning run's coordinator inbox.
//!
//! Two background loops, spawned once per `Dispatcher` instance and kept
//! alive for the process lifetime: [`Dispatcher::run_result_consumer`] drains
//! the Bus's result channel and routes by `run_id`; [`Dispatcher::run_timeout_reaper`]
//! periodically sweeps outstanding deadlines. Both are plain `tokio::spawn`
//! loops rather than a dedicated actor framework.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodes::contract::{CancelMessage, StepExec, StepOutcome, StepResult};
use queue::Bus;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::CoordinatorMessage;

const REAPER_TICK: Duration = Duration::from_millis(250);
pub(crate) const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

struct Outstanding {
    exec: StepExec,
    deadline: Instant,
}

pub struct Dispatcher<B: Bus> {
    bus: Arc<B>,
    inboxes: Mutex<HashMap<Uuid, mpsc::Sender<CoordinatorMessage>>>,
    outstanding: Mutex<HashMap<(Uuid, String, u32), Outstanding>>,
}

impl<B: Bus + 'static> Dispatcher<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus, inboxes: Mutex::new(HashMap::new()), outstanding: Mutex::new(HashMap::new()) }
    }

    /// Register the inbox a run's coordinator wants `StepResult`s delivered
    /// to. Called once when a coordinator starts (fresh or recovered).
    pub fn register_run(&self, run_id: Uuid, inbox: mpsc::Sender<CoordinatorMessage>) {
        self.inboxes.lock().unwrap().insert(run_id, inbox);
    }

    /// Drop the inbox once a run reaches a terminal state.
    pub fn unregister_run(&self, run_id: Uuid) {
        self.inboxes.lock().unwrap().remove(&run_id);
        self.outstanding.lock().unwrap().retain(|(id, _, _), _| *id != run_id);
    }

    /// Look up a running coordinator's inbox so a caller outside the
    /// coordinator (`ControlAPI::Cancel`, an external wake delivery) can send
    /// it a [`CoordinatorMessage`] directly.
    pub fn inbox(&self, run_id: Uuid) -> Option<mpsc::Sender<CoordinatorMessage>> {
        self.inboxes.lock().unwrap().get(&run_id).cloned()
    }

    /// Publish the step and start tracking its deadline.
    pub async fn dispatch(&self, exec: StepExec) -> Result<(), queue::QueueError> {
        let deadline = Instant::now() + Duration::from_millis(exec.policy.timeout_ms) + TIMEOUT_GRACE;
        let key = (exec.run_id, exec.node_id.clone(), exec.attempt);
        self.outstanding.lock().unwrap().insert(key, Outstanding { exec: exec.clone(), deadline });
        self.bus.publish_exec(exec).await
    }

    /// Re-register a deadline for an attempt that was already published
    /// before a crash, without publishing it again. Used by recovery to
    /// restore step-level timeout tracking for runs whose `StepExec` went out
    /// on the wire under a previous process — the `outstanding` map is
    /// in-memory and does not survive the crash on its own.
    pub fn rearm(&self, exec: StepExec, deadline: Instant) {
        let key = (exec.run_id, exec.node_id.clone(), exec.attempt);
        self.outstanding.lock().unwrap().insert(key, Outstanding { exec, deadline });
    }

    /// Cancel every outstanding attempt for `run_id`: publish a best-effort
    /// Cancel on the work queue and synthesize a Cancelled result straight
    /// to the inbox, without waiting for the runner.
    pub async fn cancel_run(&self, run_id: Uuid) {
        let execs: Vec<StepExec> = {
            let outstanding = self.outstanding.lock().unwrap();
            outstanding.values().filter(|o| o.exec.run_id == run_id).map(|o| o.exec.clone()).collect()
        };
        for exec in execs {
            let _ = self
                .bus
                .publish_cancel(CancelMessage { run_id: exec.run_id, node_id: exec.node_id.clone(), attempt: exec.attempt })
                .await;
            let result = StepResult {
                run_id: exec.run_id,
                node_id: exec.node_id.clone(),
                attempt: exec.attempt,
                idempotency_key: exec.idempotency_key.clone(),
                outcome: StepOutcome::Cancelled,
                observed_duration_ms: 0,
                attachment_refs: Vec::new(),
            };
            self.route_result(result).await;
        }
    }

    async fn route_result(&self, result: StepResult) {
        let key = (result.run_id, result.node_id.clone(), result.attempt);
        self.outstanding.lock().unwrap().remove(&key);

        let inbox = self.inboxes.lock().unwrap().get(&result.run_id).cloned();
        match inbox {
            Some(inbox) => {
                if inbox.send(CoordinatorMessage::StepResult(result)).await.is_err() {
                    debug!("coordinator inbox closed before result delivery");
                }
            }
            None => warn!(run_id = %result.run_id, "no registered coordinator for step result"),
        }
    }

    /// Drain the Bus's result channel forever, routing each result by
    /// `run_id`. Intended to be `tokio::spawn`ed once.
    pub async fn run_result_consumer(self: Arc<Self>) {
        loop {
            match self.bus.next_result().await {
                Ok(Some(result)) => self.route_result(result).await,
                Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(err) => {
                    warn!(error = %err, "bus result consumer error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Periodically sweep outstanding attempts past their deadline and
    /// synthesize a TimedOut result for each.
    pub async fn run_timeout_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REAPER_TICK);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let expired: Vec<StepExec> = {
                let outstanding = self.outstanding.lock().unwrap();
                outstanding.values().filter(|o| o.deadline <= now).map(|o| o.exec.clone()).collect()
            };
            for exec in expired {
                let result = StepResult {
                    run_id: exec.run_id,
                    node_id: exec.node_id.clone(),
                    attempt: exec.attempt,
                    idempotency_key: exec.idempotency_key.clone(),
                    outcome: StepOutcome::TimedOut,
                    observed_duration_ms: exec.policy.timeout_ms,
                    attachment_refs: Vec::new(),
                };
                self.route_result(result).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue::InMemoryBus;
    use serde_json::json;

    fn sample_exec(run_id: Uuid, timeout_ms: u64) -> StepExec {
        StepExec {
            run_id,
            node_id: "a".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            node_type: "mock".into(),
            params: json!({}),
            input: json!({}),
            policy: nodes::contract::NodePolicy { timeout_ms, ..Default::default() },
            trace_id: "t".into(),
            cancellation_token: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn dispatch_publishes_to_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Dispatcher::new(bus.clone());
        let run_id = Uuid::new_v4();
        dispatcher.dispatch(sample_exec(run_id, 1000)).await.unwrap();
        assert_eq!(bus.exec_queue_depth("mock"), 1);
    }

    #[tokio::test]
    async fn cancel_run_routes_cancelled_result_to_inbox() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
        let run_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.register_run(run_id, tx);
        dispatcher.dispatch(sample_exec(run_id, 1000)).await.unwrap();

        dispatcher.cancel_run(run_id).await;

        let msg = rx.recv().await.unwrap();
        match msg {
            CoordinatorMessage::StepResult(result) => {
                assert!(matches!(result.outcome, StepOutcome::Cancelled));
            }
            _ => panic!("expected a StepResult message"),
        }
    }

    #[tokio::test]
    async fn rearmed_deadline_still_times_out() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
        let run_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.register_run(run_id, tx);
        // Simulate a recovered attempt: the StepExec already went out under a
        // previous process, so we re-arm its deadline without re-dispatching.
        dispatcher.rearm(sample_exec(run_id, 0), Instant::now());

        let reaper = tokio::spawn(dispatcher.clone().run_timeout_reaper());
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        reaper.abort();

        match msg {
            CoordinatorMessage::StepResult(result) => assert!(matches!(result.outcome, StepOutcome::TimedOut)),
            _ => panic!("expected a StepResult message"),
        }
        assert_eq!(bus.exec_queue_depth("mock"), 0, "rearm must not re-publish the exec");
    }

    #[tokio::test]
    async fn timeout_reaper_synthesizes_timed_out_result() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
        let run_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.register_run(run_id, tx);
        dispatcher.dispatch(sample_exec(run_id, 0)).await.unwrap();

        let reaper = tokio::spawn(dispatcher.clone().run_timeout_reaper());
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        reaper.abort();

        match msg {
            CoordinatorMessage::StepResult(result) => assert!(matches!(result.outcome, StepOutcome::TimedOut)),
            _ => panic!("expected a StepResult message"),
        }
    }
}
