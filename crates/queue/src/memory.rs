//! In-memory [`Bus`] implementation.
//!
//! Backs unit and integration tests and local development without a real
//! broker. Durability across a process
//! crash is not modeled — that property belongs to a production broker
//! (NATS/SQS/Kafka-backed `Bus` impl), not this reference one.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use nodes::contract::{CancelMessage, StepExec, StepResult};
use tokio::sync::broadcast;

use crate::bus::Bus;
use crate::error::QueueError;
use crate::events::RunEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct InMemoryBus {
    exec_queues: Mutex<HashMap<String, VecDeque<StepExec>>>,
    results: Mutex<VecDeque<StepResult>>,
    cancels: Mutex<VecDeque<CancelMessage>>,
    events_tx: broadcast::Sender<RunEvent>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            exec_queues: Mutex::new(HashMap::new()),
            results: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(VecDeque::new()),
            events_tx,
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish_exec(&self, exec: StepExec) -> Result<(), QueueError> {
        self.exec_queues
            .lock()
            .unwrap()
            .entry(exec.node_type.clone())
            .or_default()
            .push_back(exec);
        Ok(())
    }

    async fn next_exec(&self, node_type: &str) -> Result<Option<StepExec>, QueueError> {
        Ok(self
            .exec_queues
            .lock()
            .unwrap()
            .get_mut(node_type)
            .and_then(VecDeque::pop_front))
    }

    async fn publish_result(&self, result: StepResult) -> Result<(), QueueError> {
        self.results.lock().unwrap().push_back(result);
        Ok(())
    }

    async fn next_result(&self) -> Result<Option<StepResult>, QueueError> {
        Ok(self.results.lock().unwrap().pop_front())
    }

    async fn publish_cancel(&self, msg: CancelMessage) -> Result<(), QueueError> {
        self.cancels.lock().unwrap().push_back(msg);
        Ok(())
    }

    async fn next_cancel(&self) -> Result<Option<CancelMessage>, QueueError> {
        Ok(self.cancels.lock().unwrap().pop_front())
    }

    async fn publish_event(&self, event: RunEvent) -> Result<(), QueueError> {
        // `send` only errors when there are zero subscribers; a best-effort
        // topic with no listeners is not a failure.
        let _ = self.events_tx.send(event);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.events_tx.subscribe()
    }

    fn exec_queue_depth(&self, node_type: &str) -> usize {
        self.exec_queues
            .lock()
            .unwrap()
            .get(node_type)
            .map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_exec(node_type: &str) -> StepExec {
        StepExec {
            run_id: Uuid::new_v4(),
            node_id: "n1".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            node_type: node_type.into(),
            params: json!({}),
            input: json!({}),
            policy: Default::default(),
            trace_id: "t".into(),
            cancellation_token: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn exec_queue_is_fifo_per_node_type() {
        let bus = InMemoryBus::new();
        bus.publish_exec(sample_exec("http")).await.unwrap();
        bus.publish_exec(sample_exec("http")).await.unwrap();
        assert_eq!(bus.exec_queue_depth("http"), 2);

        bus.next_exec("http").await.unwrap();
        assert_eq!(bus.exec_queue_depth("http"), 1);
        assert_eq!(bus.exec_queue_depth("transform"), 0);
    }

    #[tokio::test]
    async fn event_topic_is_best_effort() {
        let bus = InMemoryBus::new();
        // Publishing with no subscribers must not error.
        let event = RunEvent {
            run_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            sequence: 1,
            kind: crate::events::RunEventKind::RunStarted,
            emitted_at: chrono::Utc::now(),
        };
        bus.publish_event(event).await.unwrap();
    }
}
