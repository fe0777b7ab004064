//! Typed error type for the queue crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue channel closed")]
    Closed,

    #[error("send failed: inbox or queue is full")]
    Full,
}
