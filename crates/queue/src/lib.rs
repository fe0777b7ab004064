//! `queue` crate — the durable work queue and best-effort event topic (the
//! `Bus`).

pub mod bus;
pub mod error;
pub mod events;
pub mod memory;

pub use bus::Bus;
pub use error::QueueError;
pub use events::{RunEvent, RunEventKind};
pub use memory::InMemoryBus;
