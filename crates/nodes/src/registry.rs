//! Maps `node_type` strings to registered `ExecutableNode` implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ExecutableNode;

/// Shared, read-mostly table consulted by a runner to resolve a node-type
/// tag carried on a `StepExec` envelope into the implementation to run.
pub type NodeRegistry = HashMap<String, Arc<dyn ExecutableNode>>;

/// Build the registry of built-in node types shipped with this crate.
///
/// Callers (typically the reference `LocalRunner` or a test harness) are
/// free to insert additional entries — e.g. plugin or WASM-backed nodes —
/// into the map this returns.
pub fn builtin_registry() -> NodeRegistry {
    let mut registry: NodeRegistry = HashMap::new();
    registry.insert(
        "http".to_string(),
        Arc::new(crate::builtin::http::HttpNode) as Arc<dyn ExecutableNode>,
    );
    registry.insert(
        "transform".to_string(),
        Arc::new(crate::builtin::transform::TransformNode) as Arc<dyn ExecutableNode>,
    );
    registry.insert(
        "branch".to_string(),
        Arc::new(crate::builtin::branch::BranchNode) as Arc<dyn ExecutableNode>,
    );
    registry
}
