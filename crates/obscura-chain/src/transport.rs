use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::ChainError;

/// JSON-RPC 2.0 client over HTTP POST.
///
/// Uses raw reqwest with serde_json rather than a full RPC framework: the
/// per-chain endpoints speak subtly different dialects and the adapters
/// own interpretation of `result`.
pub struct RpcTransport {
    url: String,
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl RpcTransport {
    pub fn new(url: &str, timeout_ms: u64, credentials: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        let credentials = credentials.and_then(|c| {
            c.split_once(':')
                .map(|(u, p)| (u.to_string(), p.to_string()))
        });
        Self {
            url: url.to_string(),
            client,
            credentials,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call a JSON-RPC method and return the `result` field. Native HTTP
    /// failures are classified here; JSON-RPC `error` envelopes come back
    /// as `ChainError::Rpc` for the adapter to classify.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChainError::Timeout {
                    operation: method.to_string(),
                }
            } else if e.is_connect() {
                ChainError::Network(e.to_string())
            } else {
                ChainError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ChainError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ChainError::Unavailable);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Protocol(format!("malformed response: {e}")))?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            debug!(method, code, %message, "rpc error envelope");
            return Err(ChainError::Rpc { code, message });
        }

        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Protocol("response missing result".into()))
    }
}
