//! `engine` crate — core domain models, DAG validation, and the execution
//! engine: Scheduler, RateLimiter, Dispatcher, RunCoordinator, EventPublisher.

pub mod config;
pub mod coordinator;
pub mod dag;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod models;
pub mod rate_limiter;
pub mod scheduler;

pub use config::EngineConfig;
pub use coordinator::{CoordinatorMessage, RunCoordinator, Supervisor, WorkflowSource};
pub use dag::validate_dag;
pub use dispatcher::Dispatcher;
pub use error::EngineError;
pub use events::{BusEventPublisher, EventPublisher};
pub use models::{Edge, NodeDefinition, Run, Step, Trigger, Workflow};
pub use rate_limiter::RateLimiter;
pub use scheduler::{Action, Scheduler};

#[cfg(test)]
mod coordinator_tests;
