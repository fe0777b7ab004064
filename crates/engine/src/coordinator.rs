//! `RunCoordinator`: the single-writer state machine for one
//! run. Every inbound signal — a `StepResult`, a `Cancel`, an external
//! wake — is funnelled through this run's bounded inbox; the coordinator
//! applies it, persists the resulting transition, and asks the
//! [`Scheduler`](crate::scheduler::Scheduler) for next actions. No other
//! task ever mutates this run's in-memory state.
//!
//! [`Supervisor`] is the process-level owner of coordinators: it claims a
//! run's lease, spawns a fresh or recovered [`RunCoordinator`], and drives
//! crash recovery on startup via `ListRunsNeedingRecovery`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::models::{CommitOutcome, StepOutcomeRecord};
use db::Store;
use nodes::contract::{ExternalWake, StepExec, StepOutcome, StepResult};
use queue::events::RunEventKind;
use queue::Bus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::EventPublisher;
use crate::models::{NodeState, Run, RunState, Step, Workflow};
use crate::rate_limiter::{Admission, RateLimiter};
use crate::scheduler::{Action, Scheduler};

/// Everything that can arrive in a run's inbox.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A real or synthesized result for one dispatched attempt.
    StepResult(StepResult),
    /// `ControlAPI::Cancel`.
    Cancel,
    /// An external wake redeeming a wait token.
    ExternalWake(ExternalWake),
}

/// Resolves a `(workflow_id, version)` pair to its immutable definition.
/// Kept as a trait rather than a concrete `db` dependency so `engine` never
/// has to know how workflow definitions are actually stored — the `api`
/// crate owns that.
#[async_trait::async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, workflow_id: Uuid, version: i32) -> Result<Arc<Workflow>, EngineError>;
}

/// The single-writer owner of one run's in-memory state.
pub struct RunCoordinator<S: Store, B: Bus> {
    owner: String,
    run: Run,
    workflow: Arc<Workflow>,
    step_history: Vec<Step>,
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<B>>,
    rate_limiter: Arc<RateLimiter>,
    publisher: Arc<dyn EventPublisher>,
    config: EngineConfig,
    inbox_tx: mpsc::Sender<CoordinatorMessage>,
    inbox_rx: mpsc::Receiver<CoordinatorMessage>,
    /// `wait_token -> node_id`, for redeeming async/long-running nodes.
    wait_tokens: HashMap<String, String>,
    /// Set once a `Cancel` or run-timeout is being processed; new
    /// dispatches are refused and the run settles into this terminal state
    /// once every `Dispatched` attempt is accounted for.
    pending_terminal: Option<RunState>,
    next_wake: Option<DateTime<Utc>>,
}

impl<S: Store + 'static, B: Bus + 'static> RunCoordinator<S, B> {
    /// The sender half new callers (ControlAPI, the dispatcher registry)
    /// use to reach this run's inbox.
    pub fn inbox_sender(&self) -> mpsc::Sender<CoordinatorMessage> {
        self.inbox_tx.clone()
    }

    fn new_inner(
        owner: String,
        run: Run,
        workflow: Arc<Workflow>,
        step_history: Vec<Step>,
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<B>>,
        rate_limiter: Arc<RateLimiter>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        Self {
            owner,
            run,
            workflow,
            step_history,
            store,
            dispatcher,
            rate_limiter,
            publisher,
            config,
            inbox_tx,
            inbox_rx,
            wait_tokens: HashMap::new(),
            pending_terminal: None,
            next_wake: None,
        }
    }

    /// A brand-new run, never before persisted (`ControlAPI::StartRun`).
    #[allow(clippy::too_many_arguments)]
    pub fn for_new_run(
        owner: String,
        run: Run,
        workflow: Arc<Workflow>,
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<B>>,
        rate_limiter: Arc<RateLimiter>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self::new_inner(owner, run, workflow, Vec::new(), store, dispatcher, rate_limiter, publisher, config)
    }

    /// A run reloaded from the `Store` after a coordinator crash.
    /// `step_history` must already include the wait tokens
    /// outstanding for any `Waiting` node — the caller (the [`Supervisor`])
    /// derives those from the run's last step per node before constructing
    /// this.
    #[allow(clippy::too_many_arguments)]
    pub fn recovered(
        owner: String,
        run: Run,
        workflow: Arc<Workflow>,
        step_history: Vec<Step>,
        wait_tokens: HashMap<String, String>,
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<B>>,
        rate_limiter: Arc<RateLimiter>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        let mut coordinator =
            Self::new_inner(owner, run, workflow, step_history, store, dispatcher, rate_limiter, publisher, config);
        coordinator.wait_tokens = wait_tokens;
        coordinator
    }

    /// Drive this run to a terminal state. Intended to be `tokio::spawn`ed
    /// once per run; returns once the run is terminal.
    #[instrument(skip(self), fields(run_id = %self.run.id, workflow_id = %self.run.workflow_id))]
    pub async fn run(mut self) {
        self.dispatcher.register_run(self.run.id, self.inbox_tx.clone());

        if self.run.state == RunState::Pending {
            self.transition(RunState::Running, None).await;
            self.publish(RunEventKind::RunStarted).await;
        }
        if self.run.started_at.is_none() {
            self.run.started_at = Some(Utc::now());
        }

        self.advance(Utc::now()).await;

        let run_deadline = self.run.started_at.unwrap_or_else(Utc::now)
            + ChronoDuration::from_std(self.config.default_run_timeout).unwrap_or_default();
        let mut lease_ticker = tokio::time::interval(self.config.lease_renew_interval);
        lease_ticker.tick().await; // first tick fires immediately; we already hold the lease

        while !self.run.state.is_terminal() {
            let wake_delay = self.next_wake.map(|at| {
                (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO)
            });

            tokio::select! {
                _ = lease_ticker.tick() => {
                    self.renew_lease().await;
                    if Utc::now() > run_deadline && self.pending_terminal.is_none() {
                        self.begin_terminal(RunState::TimedOut).await;
                    }
                }
                _ = sleep_or_pending(wake_delay) => {
                    self.advance(Utc::now()).await;
                }
                msg = self.inbox_rx.recv() => {
                    match msg {
                        Some(CoordinatorMessage::StepResult(result)) => self.handle_step_result(result).await,
                        Some(CoordinatorMessage::Cancel) => self.begin_terminal(RunState::Cancelled).await,
                        Some(CoordinatorMessage::ExternalWake(wake)) => self.handle_external_wake(wake).await,
                        None => break,
                    }
                }
            }
        }

        self.dispatcher.unregister_run(self.run.id);
        info!(state = %self.run.state, "run reached terminal state");
    }

    /// Recompute the Ready/Skipped frontier and act on whatever the
    /// Scheduler emits.
    async fn advance(&mut self, now: DateTime<Utc>) {
        if self.run.state.is_terminal() {
            return;
        }

        let (new_states, actions) = Scheduler::advance(
            &self.workflow,
            self.run.id,
            &self.run.tenant_id,
            self.run.node_states.clone(),
            &self.run.outputs,
            &self.run.trigger_payload,
            &self.step_history,
            now,
        );
        self.run.node_states = new_states;
        self.next_wake = None;

        for action in actions {
            match action {
                Action::Dispatch(exec) => {
                    if self.pending_terminal.is_some() {
                        // Cancellation/timeout takes precedence over emitting new
                        // work; the node never actually ran this attempt.
                        self.run.node_states.insert(exec.node_id.clone(), NodeState::Cancelled);
                    } else {
                        self.try_dispatch(exec).await;
                    }
                }
                Action::WakeAt(at) => {
                    if self.pending_terminal.is_none() {
                        self.next_wake = Some(self.next_wake.map_or(at, |cur| cur.min(at)));
                    }
                }
                Action::FailRun { reason } => {
                    if self.pending_terminal.is_none() {
                        self.finish(RunState::Failed, Some(reason), RunEventKind::RunFailed { reason: String::new() }).await;
                    }
                }
                Action::FinishRun => {
                    if self.pending_terminal.is_none() {
                        self.finish(RunState::Succeeded, None, RunEventKind::RunSucceeded).await;
                    }
                }
                Action::RetryScheduled { node_id, attempt, after_ms } => {
                    self.publish(RunEventKind::StepRetryScheduled { node_id, attempt, after_ms }).await;
                }
            }
        }

        if let Some(target) = self.pending_terminal {
            let any_dispatched = self.run.node_states.values().any(|s| *s == NodeState::Dispatched);
            if !any_dispatched {
                let reason = match target {
                    RunState::Cancelled => "cancelled by request",
                    RunState::TimedOut => "run exceeded its timeout",
                    _ => "terminated",
                };
                let kind = match target {
                    RunState::Cancelled => RunEventKind::RunCancelled,
                    RunState::TimedOut => RunEventKind::RunTimedOut,
                    other => RunEventKind::RunFailed { reason: other.to_string() },
                };
                self.finish(target, Some(reason.to_string()), kind).await;
            }
        }

        if !self.run.state.is_terminal() {
            let _ = self.store.persist_node_states(self.run.id, self.run.node_states_json()).await;
            self.publish(RunEventKind::RunProgress).await;
        }
    }

    async fn try_dispatch(&mut self, exec: nodes::contract::StepExec) {
        match self.rate_limiter.try_acquire(&self.run.tenant_id, &exec.node_type, 1) {
            Admission::Acquired => {
                let step = Step {
                    id: Uuid::new_v4(),
                    run_id: exec.run_id,
                    node_id: exec.node_id.clone(),
                    attempt: exec.attempt,
                    state: NodeState::Dispatched,
                    queued_at: Utc::now(),
                    started_at: Some(Utc::now()),
                    finished_at: None,
                    input: exec.input.clone(),
                    output: None,
                    error: None,
                    duration_ms: None,
                    idempotency_key: exec.idempotency_key.clone(),
                };
                if let Err(err) = self.store.append_step_attempt(step.to_row()).await {
                    warn!(error = %err, node_id = %exec.node_id, "failed to append step attempt; reverting to Ready");
                    self.run.node_states.insert(exec.node_id.clone(), NodeState::Ready);
                    return;
                }
                self.step_history.push(step);
                self.publish_node_event(RunEventKind::StepStarted {
                    node_id: exec.node_id.clone(),
                    attempt: exec.attempt,
                })
                .await;
                if let Err(err) = self.dispatcher.dispatch(exec).await {
                    warn!(error = %err, "dispatch onto work queue failed");
                }
            }
            Admission::Denied { wait_hint } => {
                // Stays Ready; the Scheduler re-emits it once the hint elapses.
                self.run.node_states.insert(exec.node_id.clone(), NodeState::Ready);
                let at = Utc::now() + ChronoDuration::from_std(wait_hint).unwrap_or_default();
                self.next_wake = Some(self.next_wake.map_or(at, |cur| cur.min(at)));
            }
        }
    }

    async fn handle_step_result(&mut self, result: StepResult) {
        let Some(step) = self
            .step_history
            .iter()
            .find(|s| s.node_id == result.node_id && s.attempt == result.attempt)
        else {
            warn!(node_id = %result.node_id, attempt = result.attempt, "step result for unknown attempt, ignoring");
            return;
        };
        let step_id = step.id;
        let attempts_so_far = self.step_history.iter().filter(|s| s.node_id == result.node_id).count() as u32;

        let (new_states, new_outputs, action) = Scheduler::apply_step_outcome(
            &self.workflow,
            self.run.node_states.clone(),
            self.run.outputs.clone(),
            &result.node_id,
            attempts_so_far,
            &result.outcome,
        );

        let record = outcome_record(&result.outcome, result.observed_duration_ms);
        let commit = self
            .store
            .commit_step_result(step_id, &result.idempotency_key, record, node_states_json(&new_states))
            .await;

        match commit {
            Ok(CommitOutcome::Committed) => {
                self.run.node_states = new_states;
                self.run.outputs = new_outputs;
                if let Some(s) = self.step_history.iter_mut().find(|s| s.id == step_id) {
                    s.state = terminal_state_for(&result.outcome);
                    s.finished_at = Some(Utc::now());
                    s.duration_ms = Some(result.observed_duration_ms);
                }
                if let StepOutcome::Succeeded { wait_token: Some(token), .. } = &result.outcome {
                    self.wait_tokens.insert(token.clone(), result.node_id.clone());
                }
                self.publish_outcome_event(&result.node_id, result.attempt, &result.outcome).await;
                match action {
                    Some(Action::FailRun { reason }) => {
                        if self.pending_terminal.is_none() {
                            self.finish(RunState::Failed, Some(reason), RunEventKind::RunFailed { reason: String::new() }).await;
                        }
                    }
                    Some(Action::RetryScheduled { node_id, attempt, after_ms }) => {
                        self.publish(RunEventKind::StepRetryScheduled { node_id, attempt, after_ms }).await;
                    }
                    _ => {}
                }
                if !self.run.state.is_terminal() {
                    self.advance(Utc::now()).await;
                }
            }
            Ok(CommitOutcome::AlreadyCommitted) => {
                debug!(node_id = %result.node_id, attempt = result.attempt, "duplicate step result discarded");
            }
            Err(err) => {
                error!(error = %err, "failed to commit step result; run blocked until the store recovers");
            }
        }
    }

    async fn handle_external_wake(&mut self, wake: ExternalWake) {
        let Some(node_id) = self.wait_tokens.remove(&wake.wait_token) else {
            warn!(wait_token = %wake.wait_token, "unknown or already-redeemed wait token");
            return;
        };
        let Some(step) = self.step_history.iter().rev().find(|s| s.node_id == node_id) else {
            warn!(node_id = %node_id, "wait token redeemed for a node with no step history");
            return;
        };
        let step_id = step.id;
        let idempotency_key = step.idempotency_key.clone();
        let attempt = step.attempt;
        let attempts_so_far = self.step_history.iter().filter(|s| s.node_id == node_id).count() as u32;

        let (new_states, new_outputs, action) = Scheduler::apply_step_outcome(
            &self.workflow,
            self.run.node_states.clone(),
            self.run.outputs.clone(),
            &node_id,
            attempts_so_far,
            &wake.outcome,
        );

        let record = outcome_record(&wake.outcome, 0);
        let commit = self
            .store
            .commit_step_result(step_id, &idempotency_key, record, node_states_json(&new_states))
            .await;

        match commit {
            Ok(CommitOutcome::Committed) => {
                self.run.node_states = new_states;
                self.run.outputs = new_outputs;
                if let Some(s) = self.step_history.iter_mut().find(|s| s.id == step_id) {
                    s.state = terminal_state_for(&wake.outcome);
                    s.finished_at = Some(Utc::now());
                }
                self.publish_outcome_event(&node_id, attempt, &wake.outcome).await;
                match action {
                    Some(Action::FailRun { reason }) => {
                        if self.pending_terminal.is_none() {
                            self.finish(RunState::Failed, Some(reason), RunEventKind::RunFailed { reason: String::new() }).await;
                        }
                    }
                    Some(Action::RetryScheduled { node_id, attempt, after_ms }) => {
                        self.publish(RunEventKind::StepRetryScheduled { node_id, attempt, after_ms }).await;
                    }
                    _ => {}
                }
                if !self.run.state.is_terminal() {
                    self.advance(Utc::now()).await;
                }
            }
            Ok(CommitOutcome::AlreadyCommitted) => {
                debug!(wait_token = %wake.wait_token, "wait token redeemed twice, second redemption discarded");
            }
            Err(err) => {
                error!(error = %err, "failed to commit externally-woken step result");
            }
        }
    }

    /// Begin cancelling or timing out this run: refuse new dispatches,
    /// publish a best-effort Cancel for every outstanding attempt, and let
    /// [`Self::advance`] settle the run once nothing is left `Dispatched`.
    async fn begin_terminal(&mut self, target: RunState) {
        if self.run.state.is_terminal() || self.pending_terminal.is_some() {
            return;
        }
        self.pending_terminal = Some(target);
        self.dispatcher.cancel_run(self.run.id).await;
        self.advance(Utc::now()).await;
    }

    async fn finish(&mut self, target: RunState, reason: Option<String>, kind: RunEventKind) {
        let kind = match (&kind, &reason) {
            (RunEventKind::RunFailed { .. }, Some(r)) => RunEventKind::RunFailed { reason: r.clone() },
            (other, _) => other.clone(),
        };
        self.transition(target, reason).await;
        self.publish(kind).await;
    }

    async fn transition(&mut self, to: RunState, reason: Option<String>) {
        let from = self.run.state;
        match self.store.update_run_state(self.run.id, &from.to_string(), &to.to_string(), reason.clone()).await {
            Ok(()) => {
                self.run.state = to;
                if reason.is_some() {
                    self.run.failure_reason = reason;
                }
                let now = Utc::now();
                if self.run.started_at.is_none() && to == RunState::Running {
                    self.run.started_at = Some(now);
                }
                if to.is_terminal() {
                    self.run.finished_at = Some(now);
                }
            }
            Err(err) => {
                error!(error = %err, %from, %to, "run state transition rejected");
            }
        }
    }

    async fn renew_lease(&self) {
        let expiry = Utc::now() + ChronoDuration::from_std(self.config.coordinator_lease).unwrap_or_default();
        match self.store.renew_lease(self.run.id, &self.owner, expiry).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %self.run.id, "lost lease ownership to another coordinator"),
            Err(err) => warn!(error = %err, "failed to renew run lease"),
        }
    }

    async fn publish(&self, kind: RunEventKind) {
        if let Err(err) = self.publisher.publish(self.run.id, self.run.workflow_id, &self.run.tenant_id, kind).await {
            warn!(error = %err, "failed to publish run event");
        }
    }

    async fn publish_node_event(&self, kind: RunEventKind) {
        self.publish(kind).await;
    }

    async fn publish_outcome_event(&self, node_id: &str, attempt: u32, outcome: &StepOutcome) {
        let kind = match outcome {
            StepOutcome::Succeeded { .. } => RunEventKind::StepSucceeded { node_id: node_id.to_string(), attempt },
            StepOutcome::Failed { message, .. } => {
                RunEventKind::StepFailed { node_id: node_id.to_string(), attempt, message: message.clone() }
            }
            StepOutcome::Cancelled => {
                RunEventKind::StepFailed { node_id: node_id.to_string(), attempt, message: "cancelled".into() }
            }
            StepOutcome::TimedOut => {
                RunEventKind::StepFailed { node_id: node_id.to_string(), attempt, message: "timed out".into() }
            }
        };
        self.publish(kind).await;
    }
}

fn sleep_or_pending(delay: Option<std::time::Duration>) -> impl std::future::Future<Output = ()> {
    async move {
        match delay {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    }
}

fn node_states_json(states: &crate::models::NodeStateMap) -> serde_json::Value {
    serde_json::to_value(
        states.iter().map(|(k, v)| (k.clone(), v.to_string())).collect::<HashMap<String, String>>(),
    )
    .expect("NodeStateMap always serializes")
}

fn terminal_state_for(outcome: &StepOutcome) -> NodeState {
    match outcome {
        StepOutcome::Succeeded { wait_token: None, .. } => NodeState::Succeeded,
        StepOutcome::Succeeded { wait_token: Some(_), .. } => NodeState::Waiting,
        StepOutcome::Cancelled => NodeState::Cancelled,
        StepOutcome::Failed { .. } | StepOutcome::TimedOut => NodeState::Failed,
    }
}

fn outcome_record(outcome: &StepOutcome, duration_ms: u64) -> StepOutcomeRecord {
    match outcome {
        StepOutcome::Succeeded { output, wait_token: Some(token) } => StepOutcomeRecord {
            state: "waiting".into(),
            // Wrapped so recovery can recover the wait token without a dedicated
            // column.
            output: Some(serde_json::json!({ "output": output, "wait_token": token })),
            error: None,
            duration_ms: Some(duration_ms as i64),
        },
        StepOutcome::Succeeded { output, wait_token: None } => StepOutcomeRecord {
            state: "succeeded".into(),
            output: Some(output.clone()),
            error: None,
            duration_ms: Some(duration_ms as i64),
        },
        StepOutcome::Failed { message, .. } => StepOutcomeRecord {
            state: "failed".into(),
            output: None,
            error: Some(message.clone()),
            duration_ms: Some(duration_ms as i64),
        },
        StepOutcome::Cancelled => StepOutcomeRecord {
            state: "cancelled".into(),
            output: None,
            error: Some("cancelled".into()),
            duration_ms: Some(duration_ms as i64),
        },
        StepOutcome::TimedOut => StepOutcomeRecord {
            state: "failed".into(),
            output: None,
            error: Some("timed out".into()),
            duration_ms: Some(duration_ms as i64),
        },
    }
}

/// Process-level owner of coordinators: claims leases, spawns
/// fresh and recovered [`RunCoordinator`]s, and is the entry point the
/// `cli` crate's `recover` subcommand calls into.
pub struct Supervisor<S: Store, B: Bus> {
    pub owner: String,
    pub store: Arc<S>,
    pub dispatcher: Arc<Dispatcher<B>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub config: EngineConfig,
    pub workflows: Arc<dyn WorkflowSource>,
}

impl<S: Store + 'static, B: Bus + 'static> Supervisor<S, B> {
    pub fn new(
        owner: String,
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<B>>,
        rate_limiter: Arc<RateLimiter>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
        workflows: Arc<dyn WorkflowSource>,
    ) -> Self {
        Self { owner, store, dispatcher, rate_limiter, publisher, config, workflows }
    }

    /// Persist a newly created run, claim its lease, and spawn a coordinator
    /// for it. `start_idempotency_key` is `ControlAPI::StartRun`'s dedup
    /// key; the caller is expected to have already checked
    /// `Store::find_run_by_start_key` before constructing `run`.
    pub async fn spawn_new_run(
        &self,
        run: Run,
        workflow: Arc<Workflow>,
        start_idempotency_key: Option<String>,
    ) -> Result<JoinHandle<()>, EngineError> {
        self.store.create_run(run.to_row(start_idempotency_key)).await?;
        let lease_expiry = Utc::now() + ChronoDuration::from_std(self.config.coordinator_lease).unwrap_or_default();
        if !self.store.claim_run(run.id, &self.owner, lease_expiry).await? {
            return Err(EngineError::Unavailable("failed to claim lease on a just-created run".into()));
        }

        let coordinator = RunCoordinator::for_new_run(
            self.owner.clone(),
            run,
            workflow,
            self.store.clone(),
            self.dispatcher.clone(),
            self.rate_limiter.clone(),
            self.publisher.clone(),
            self.config.clone(),
        );
        Ok(tokio::spawn(coordinator.run()))
    }

    /// Scan for runs whose lease has expired and resume each one.
    /// Returns the number of runs re-claimed.
    #[instrument(skip(self))]
    pub async fn recover_all(&self) -> Result<usize, EngineError> {
        let candidates = self.store.list_runs_needing_recovery(Utc::now()).await?;
        let mut recovered = 0usize;

        for run_row in candidates {
            let run_id = run_row.id;
            let lease_expiry = Utc::now() + ChronoDuration::from_std(self.config.coordinator_lease).unwrap_or_default();
            match self.store.claim_run(run_id, &self.owner, lease_expiry).await {
                Ok(true) => {}
                Ok(false) => continue, // another coordinator won the race
                Err(err) => {
                    warn!(error = %err, %run_id, "failed to claim run during recovery");
                    continue;
                }
            }

            let workflow = match self.workflows.load(run_row.workflow_id, run_row.workflow_version).await {
                Ok(wf) => wf,
                Err(err) => {
                    error!(error = %err, %run_id, "cannot recover run: workflow definition unavailable");
                    continue;
                }
            };

            let (row, step_rows) = match self.store.load_run(run_id).await {
                Ok(v) => v,
                Err(err) => {
                    error!(error = %err, %run_id, "failed to reload run during recovery");
                    continue;
                }
            };
            let steps: Vec<Step> = step_rows.into_iter().map(Step::from_row).collect();
            let run = Run::from_row(row, &steps);

            let mut wait_tokens = HashMap::new();
            for (node_id, state) in &run.node_states {
                if *state == NodeState::Waiting {
                    if let Some(step) = steps.iter().rev().find(|s| &s.node_id == node_id) {
                        let token = step
                            .output
                            .as_ref()
                            .and_then(|v| v.get("wait_token"))
                            .and_then(|v| v.as_str());
                        match token {
                            Some(token) => {
                                wait_tokens.insert(token.to_string(), node_id.clone());
                            }
                            None => warn!(%node_id, %run_id, "waiting node has no recoverable wait token"),
                        }
                    }
                }
            }

            // Re-arm the dispatcher's deadline for every node still
            // `Dispatched`: its `StepExec` already went out on the wire
            // before the crash, so the in-memory `outstanding` map lost
            // track of it. Without this, `run_timeout_reaper` never sees
            // these attempts and a runner that vanished leaves the node
            // stuck until the coarser overall run timeout fires.
            for (node_id, state) in &run.node_states {
                if *state != NodeState::Dispatched {
                    continue;
                }
                let Some(step) = steps.iter().rev().find(|s| &s.node_id == node_id && s.state == NodeState::Dispatched) else {
                    warn!(%node_id, %run_id, "dispatched node has no matching step to re-arm");
                    continue;
                };
                let Some(node_def) = workflow.node(node_id) else {
                    warn!(%node_id, %run_id, "dispatched node missing from workflow definition, cannot re-arm");
                    continue;
                };
                let cancellation_token = Uuid::new_v5(&Uuid::NAMESPACE_OID, step.idempotency_key.as_bytes());
                let exec = StepExec {
                    run_id,
                    node_id: node_id.clone(),
                    attempt: step.attempt,
                    idempotency_key: step.idempotency_key.clone(),
                    node_type: node_def.node_type.clone(),
                    params: node_def.config.clone(),
                    input: step.input.clone(),
                    policy: node_def.policy.clone(),
                    trace_id: run_id.to_string(),
                    cancellation_token,
                };
                let dispatched_at = step.started_at.unwrap_or(step.queued_at);
                let elapsed_ms = (Utc::now() - dispatched_at).num_milliseconds().max(0) as u64;
                let remaining = Duration::from_millis(exec.policy.timeout_ms)
                    .saturating_add(crate::dispatcher::TIMEOUT_GRACE)
                    .saturating_sub(Duration::from_millis(elapsed_ms));
                self.dispatcher.rearm(exec, tokio::time::Instant::now() + remaining);
            }

            info!(%run_id, "recovering run");
            let coordinator = RunCoordinator::recovered(
                self.owner.clone(),
                run,
                workflow,
                steps,
                wait_tokens,
                self.store.clone(),
                self.dispatcher.clone(),
                self.rate_limiter.clone(),
                self.publisher.clone(),
                self.config.clone(),
            );
            tokio::spawn(coordinator.run());
            recovered += 1;
        }

        Ok(recovered)
    }
}
