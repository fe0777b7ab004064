//! `transform` node — reshapes the previous node's output via a small
//! field-mapping config, without a general expression language.
//!
//! Config (`params`):
//! ```json
//! { "set": { "total": "amount", "currency_literal": null }, "keep_input": false }
//! ```
//! Each entry in `set` either copies a field named `amount` from `input`
//! (string value) or, if the config value isn't a string, is used verbatim
//! as a literal.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{ExecutableNode, NodeError};
use crate::traits::ExecutionContext;

pub struct TransformNode;

#[async_trait]
impl ExecutableNode for TransformNode {
    async fn execute(&self, params: Value, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let set = params
            .get("set")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let keep_input = params
            .get("keep_input")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut out = Map::new();
        if keep_input {
            if let Some(obj) = input.as_object() {
                out.extend(obj.clone());
            }
        }

        for (target_field, source) in set {
            match source {
                Value::String(field_name) => {
                    let value = input.get(&field_name).cloned().unwrap_or(Value::Null);
                    out.insert(target_field, value);
                }
                literal => {
                    out.insert(target_field, literal);
                }
            }
        }

        Ok(Value::Object(out))
    }
}
