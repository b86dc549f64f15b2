use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{
    RpcAlert, RpcCreateRequest, RpcCreateResponse, RpcCurrencyInfo, RpcSessionView, RpcStatus,
};

/// Obscura JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "obscura_" via `namespace`.
#[rpc(server, namespace = "obscura")]
pub trait ObscuraApi {
    // ── Public session surface ───────────────────────────────────────────────

    /// Create a mix session. Returns the one-time deposit address.
    #[method(name = "createSession")]
    async fn create_session(&self, request: RpcCreateRequest) -> RpcResult<RpcCreateResponse>;

    /// Observe a session by hex id. Coarse status only.
    #[method(name = "getSession")]
    async fn get_session(&self, session_id: String) -> RpcResult<Option<RpcSessionView>>;

    /// Cancel a session. Returns "ok", "too_late", or "not_found".
    #[method(name = "cancelSession")]
    async fn cancel_session(&self, session_id: String) -> RpcResult<String>;

    /// Enumerate enabled currencies with their limits and ladders.
    #[method(name = "listCurrencies")]
    async fn list_currencies(&self) -> RpcResult<Vec<RpcCurrencyInfo>>;

    // ── Operator surface ─────────────────────────────────────────────────────

    /// Health summary: endpoint states and session counts.
    #[method(name = "status")]
    async fn status(&self) -> RpcResult<RpcStatus>;

    /// List active alerts, oldest first.
    #[method(name = "listAlerts")]
    async fn list_alerts(&self) -> RpcResult<Vec<RpcAlert>>;

    /// Acknowledge an alert.
    #[method(name = "ackAlert")]
    async fn ack_alert(&self, alert_id: u64, actor: String) -> RpcResult<bool>;

    /// Resolve an alert.
    #[method(name = "resolveAlert")]
    async fn resolve_alert(&self, alert_id: u64, actor: String) -> RpcResult<bool>;

    /// Toggle maintenance mode (suppresses non-emergency alerting).
    #[method(name = "setMaintenanceMode")]
    async fn set_maintenance_mode(&self, on: bool, reason: String) -> RpcResult<bool>;
}
