//! `nodes` crate — the `ExecutableNode` trait, the runner wire contract, and
//! built-in node implementations.
//!
//! Every node — built-in and plugin alike — must implement [`ExecutableNode`].
//! The execution-plane side of the runner contract (what gets sent to and
//! received from the sandboxed runner) lives in [`contract`]; the sandbox
//! implementation itself is an external collaborator this crate never
//! implements.

pub mod builtin;
pub mod contract;
pub mod error;
pub mod local_runner;
pub mod mock;
pub mod registry;
pub mod traits;

pub use contract::{
    CancelMessage, ExternalWake, FailureKind, IdempotencyKey, NodePolicy, StepExec, StepOutcome,
    StepResult,
};
pub use error::NodeError;
pub use local_runner::LocalRunner;
pub use registry::{builtin_registry, NodeRegistry};
pub use traits::{ExecutableNode, ExecutionContext};
