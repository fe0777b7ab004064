//! `branch` node — evaluates a simple predicate over its input and passes
//! the input through unchanged, annotated with the predicate's result.
//!
//! Downstream edges carry their own guard expressions (evaluated by the
//! engine's DAG walker); this node exists for workflows that want the
//! boolean itself available as data, e.g. to log or branch twice.
//!
//! Config (`params`): `{ "field": "status", "equals": "ok" }`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutableNode, NodeError};
use crate::traits::ExecutionContext;

pub struct BranchNode;

#[async_trait]
impl ExecutableNode for BranchNode {
    async fn execute(&self, params: Value, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let field = params
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Fatal("branch node missing 'field' param".into()))?;

        let expected = params.get("equals").cloned().unwrap_or(Value::Null);
        let actual = input.get(field).cloned().unwrap_or(Value::Null);
        let matched = actual == expected;

        Ok(json!({ "input": input, "matched": matched }))
    }
}
