use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use obscura_chain::ChainFacade;
use obscura_core::config::Config;
use obscura_core::error::{ErrorKind, MixError};
use obscura_core::session::OutputSpec;
use obscura_core::types::{Address, Currency, SessionId};
use obscura_health::AlertManager;
use obscura_session::{CancelOutcome, CreateRequest, SessionManager};

use crate::api::ObscuraApiServer;
use crate::types::{
    RpcAlert, RpcCreateRequest, RpcCreateResponse, RpcCurrencyInfo, RpcEndpointHealth, RpcHop,
    RpcSessionView, RpcStatus,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Map a core error onto JSON-RPC codes without leaking internals:
/// validation reads back verbatim, everything else collapses to a generic
/// message.
fn map_err(e: MixError) -> ErrorObject<'static> {
    match e.kind() {
        ErrorKind::Validation => rpc_err(-32602, e.to_string()),
        ErrorKind::Authentication | ErrorKind::Authorization => {
            rpc_err(-32001, "not authorized")
        }
        _ => rpc_err(-32603, "internal error"),
    }
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub sessions: Arc<SessionManager>,
    pub facade: Arc<ChainFacade>,
    pub alerts: Arc<AlertManager>,
    pub config: Config,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

fn parse_session_id(s: &str) -> Result<SessionId, ErrorObject<'static>> {
    SessionId::from_hex(s).map_err(|e| rpc_err(-32602, format!("invalid session id: {e}")))
}

fn parse_currency(s: &str) -> Result<Currency, ErrorObject<'static>> {
    Currency::from_code(s).ok_or_else(|| rpc_err(-32602, format!("unsupported currency: {s}")))
}

// ── RPC implementation ────────────────────────────────────────────────────────

#[async_trait]
impl ObscuraApiServer for RpcServer {
    async fn create_session(&self, request: RpcCreateRequest) -> RpcResult<RpcCreateResponse> {
        let currency = parse_currency(&request.currency)?;
        let amount: u128 = request
            .amount
            .parse()
            .map_err(|_| rpc_err(-32602, "amount must be a minor-unit integer string"))?;
        let outputs = request
            .outputs
            .into_iter()
            .map(|o| OutputSpec {
                address: Address(o.address),
                share_bps: o.share_bps,
                delay_hint: o.delay_hint,
            })
            .collect();

        let view = self
            .state
            .sessions
            .create(CreateRequest {
                currency,
                amount,
                outputs,
                fee_bps: request.fee_bps,
                refund_address: Address(request.refund_address),
            })
            .await
            .map_err(map_err)?;

        Ok(RpcCreateResponse {
            session_id: view.session_id.to_hex(),
            deposit_address: view.deposit_address.as_str().to_string(),
            expires_at: view.expires_at,
        })
    }

    async fn get_session(&self, session_id: String) -> RpcResult<Option<RpcSessionView>> {
        let id = parse_session_id(&session_id)?;
        let Some(view) = self.state.sessions.observe(&id).map_err(map_err)? else {
            return Ok(None);
        };
        Ok(Some(RpcSessionView {
            session_id: view.session_id.to_hex(),
            status: view.status,
            deposit_confirmations: view.deposit_confirmations,
            hops: view
                .hops
                .into_iter()
                .map(|(index, status)| RpcHop { index, status })
                .collect(),
            expires_at: view.expires_at,
        }))
    }

    async fn cancel_session(&self, session_id: String) -> RpcResult<String> {
        let id = parse_session_id(&session_id)?;
        let outcome = match self.state.sessions.cancel(&id).await {
            CancelOutcome::Ok => "ok",
            CancelOutcome::TooLate => "too_late",
            CancelOutcome::NotFound => "not_found",
        };
        Ok(outcome.to_string())
    }

    async fn list_currencies(&self) -> RpcResult<Vec<RpcCurrencyInfo>> {
        Ok(self
            .state
            .config
            .currencies
            .iter()
            .map(|(currency, cc)| RpcCurrencyInfo {
                currency: currency.code().to_string(),
                min_amount: cc.min_amount.to_string(),
                max_amount: cc.max_amount.to_string(),
                denominations: cc.denominations.iter().map(|d| d.to_string()).collect(),
                confirmations_required: cc.confirmations_required,
            })
            .collect())
    }

    async fn status(&self) -> RpcResult<RpcStatus> {
        let mut endpoints = Vec::new();
        for currency in self.state.facade.currencies() {
            let snapshot = self.state.facade.health(currency).map_err(map_err)?;
            endpoints.push(RpcEndpointHealth {
                currency: currency.code().to_string(),
                status: format!("{:?}", snapshot.status),
                ewma_latency_ms: snapshot.ewma_latency_ms,
                consecutive_failures: snapshot.consecutive_failures,
            });
        }
        Ok(RpcStatus {
            maintenance_mode: self.state.alerts.maintenance_mode(),
            total_sessions: self.state.sessions.store().count_sessions(),
            endpoints,
        })
    }

    async fn list_alerts(&self) -> RpcResult<Vec<RpcAlert>> {
        Ok(self
            .state
            .alerts
            .list_active()
            .into_iter()
            .map(|a| RpcAlert {
                alert_id: a.alert_id,
                severity: format!("{:?}", a.severity),
                status: format!("{:?}", a.status),
                category: a.category,
                source: a.source,
                title: a.title,
                raised_at: a.raised_at,
                repeat_count: a.repeat_count,
                escalation_level: a.escalation_level,
            })
            .collect())
    }

    async fn ack_alert(&self, alert_id: u64, actor: String) -> RpcResult<bool> {
        self.state
            .alerts
            .acknowledge(alert_id, &actor)
            .map_err(|e| rpc_err(-32602, e.to_string()))?;
        Ok(true)
    }

    async fn resolve_alert(&self, alert_id: u64, actor: String) -> RpcResult<bool> {
        self.state
            .alerts
            .resolve(alert_id, &actor)
            .map_err(|e| rpc_err(-32602, e.to_string()))?;
        Ok(true)
    }

    async fn set_maintenance_mode(&self, on: bool, reason: String) -> RpcResult<bool> {
        self.state.alerts.set_maintenance_mode(on, &reason);
        Ok(on)
    }
}
