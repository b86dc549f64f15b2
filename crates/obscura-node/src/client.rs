use anyhow::{bail, Context};

/// Simple JSON-RPC 2.0 client used by the operator subcommands to talk to
/// a running node.
///
/// Uses raw HTTP POST with serde_json rather than the full jsonrpsee
/// client to keep the operator path lean.
pub struct OperatorClient {
    url: String,
    client: reqwest::Client,
}

impl OperatorClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Call a JSON-RPC method and return the `result` field.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("connecting to node at {}", self.url))?;

        let json: serde_json::Value = resp.json().await.context("parsing RPC response")?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            bail!("RPC error: {}", err);
        }

        Ok(json["result"].clone())
    }

    pub async fn status(&self) -> anyhow::Result<serde_json::Value> {
        self.call("obscura_status", serde_json::json!([])).await
    }

    pub async fn session_show(&self, session_id: &str) -> anyhow::Result<serde_json::Value> {
        self.call("obscura_getSession", serde_json::json!([session_id]))
            .await
    }

    pub async fn alerts_list(&self) -> anyhow::Result<serde_json::Value> {
        self.call("obscura_listAlerts", serde_json::json!([])).await
    }

    pub async fn alerts_ack(&self, alert_id: u64, actor: &str) -> anyhow::Result<bool> {
        let result = self
            .call("obscura_ackAlert", serde_json::json!([alert_id, actor]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn alerts_resolve(&self, alert_id: u64, actor: &str) -> anyhow::Result<bool> {
        let result = self
            .call("obscura_resolveAlert", serde_json::json!([alert_id, actor]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn set_maintenance(&self, on: bool, reason: &str) -> anyhow::Result<bool> {
        let result = self
            .call(
                "obscura_setMaintenanceMode",
                serde_json::json!([on, reason]),
            )
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }
}
