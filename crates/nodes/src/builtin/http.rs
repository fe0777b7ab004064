//! `http` node — makes an outbound HTTP call and returns the response body.
//!
//! Config (`params`):
//! ```json
//! { "method": "GET", "url": "https://example.com", "headers": {}, "body": null }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutableNode, NodeError};
use crate::traits::ExecutionContext;

pub struct HttpNode;

#[async_trait]
impl ExecutableNode for HttpNode {
    async fn execute(&self, params: Value, _input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Fatal("http node missing 'url' param".into()))?;

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| NodeError::Fatal(format!("invalid url '{url}': {e}")))?;

        if !ctx.policy.allowed_egress_hosts.is_empty() {
            let host = parsed.host_str().unwrap_or_default();
            if !ctx.policy.allowed_egress_hosts.iter().any(|h| h == host) {
                return Err(NodeError::Fatal(format!(
                    "egress to host '{host}' is not in the node's allowed_egress_hosts"
                )));
            }
        }

        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let http_method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| NodeError::Fatal(format!("invalid HTTP method '{method}'")))?;

        let client = reqwest::Client::new();
        let mut req = client.request(http_method, parsed);

        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    req = req.header(k, v);
                }
            }
        }
        if let Some(body) = params.get("body") {
            if !body.is_null() {
                req = req.json(body);
            }
        }

        let response = req.send().await.map_err(|e| {
            NodeError::Retryable(format!("http request failed: {e}"))
        })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::Null);

        if status.is_server_error() {
            return Err(NodeError::Retryable(format!("upstream returned {status}")));
        }
        if status.is_client_error() {
            return Err(NodeError::Fatal(format!("upstream returned {status}")));
        }

        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}
