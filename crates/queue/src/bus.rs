//! The `Bus` trait — durable work queue plus best-effort event topic.
//!
//! Two logical channels, both exposed as plain async methods rather than a
//! generic pub/sub abstraction, matching how narrowly the execution plane
//! actually uses messaging:
//!
//! - *Work queue*: `publish_exec`/`next_exec` carry [`StepExec`] envelopes
//!   keyed by node-type class (`step.exec.<class>`); `publish_result`/
//!   `next_result` carry [`StepResult`] back on `step.result`.
//!   `publish_cancel`/`next_cancel` carry best-effort [`CancelMessage`]s.
//! - *Event topic*: `publish_event`/`subscribe_events` carry [`RunEvent`]s.
//!   Subscribers may miss messages — the Store remains the source of truth.

use async_trait::async_trait;
use nodes::contract::{CancelMessage, StepExec, StepResult};

use crate::error::QueueError;
use crate::events::RunEvent;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a `StepExec` onto the work queue for its node-type class.
    async fn publish_exec(&self, exec: StepExec) -> Result<(), QueueError>;

    /// Pop the next `StepExec` queued for `node_type`, if any is ready.
    /// Returns `None` rather than blocking — callers poll or `select!`.
    async fn next_exec(&self, node_type: &str) -> Result<Option<StepExec>, QueueError>;

    /// Publish a `StepResult` back to the dispatcher.
    async fn publish_result(&self, result: StepResult) -> Result<(), QueueError>;

    /// Pop the next `StepResult` waiting for any dispatcher consumer.
    async fn next_result(&self) -> Result<Option<StepResult>, QueueError>;

    /// Publish a best-effort cancellation for one outstanding attempt.
    async fn publish_cancel(&self, msg: CancelMessage) -> Result<(), QueueError>;

    /// Pop the next pending cancel message, if any.
    async fn next_cancel(&self) -> Result<Option<CancelMessage>, QueueError>;

    /// Publish a lifecycle event onto the best-effort `run.event` topic.
    async fn publish_event(&self, event: RunEvent) -> Result<(), QueueError>;

    /// Subscribe to the event topic. Lagging subscribers miss messages
    /// rather than block publishers.
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunEvent>;

    /// Approximate depth of the work queue for one node-type class, used by
    /// the Scheduler's backpressure check.
    fn exec_queue_depth(&self, node_type: &str) -> usize;
}
