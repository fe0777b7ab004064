//! Reference built-in node implementations.
//!
//! These are ordinary in-process `ExecutableNode`s, useful for local
//! development and the `LocalRunner` test harness. A production deployment
//! is expected to run most node types inside the actual sandbox; these
//! exist so the node-type registry isn't empty in the reference build.

pub mod branch;
pub mod http;
pub mod transform;
