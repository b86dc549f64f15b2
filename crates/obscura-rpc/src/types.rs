use serde::{Deserialize, Serialize};

/// One requested payout leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcOutput {
    pub address: String,
    pub share_bps: u16,
    /// Optional extra delay preference in seconds.
    pub delay_hint: Option<i64>,
}

/// `obscura_createSession` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCreateRequest {
    pub currency: String,
    /// Amount in minor units (u128 as string).
    pub amount: String,
    pub outputs: Vec<RpcOutput>,
    pub fee_bps: Option<u16>,
    pub refund_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCreateResponse {
    pub session_id: String,
    pub deposit_address: String,
    pub expires_at: i64,
}

/// Coarse hop view: index and status word only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcHop {
    pub index: u32,
    pub status: String,
}

/// `obscura_getSession` response. No amounts, no addresses, no internal
/// failure detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSessionView {
    pub session_id: String,
    pub status: String,
    pub deposit_confirmations: u32,
    pub hops: Vec<RpcHop>,
    pub expires_at: i64,
}

/// One supported currency's parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCurrencyInfo {
    pub currency: String,
    /// Minor units as strings (u128-safe).
    pub min_amount: String,
    pub max_amount: String,
    pub denominations: Vec<String>,
    pub confirmations_required: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEndpointHealth {
    pub currency: String,
    pub status: String,
    pub ewma_latency_ms: f64,
    pub consecutive_failures: u32,
}

/// `obscura_status` response for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub maintenance_mode: bool,
    pub total_sessions: u64,
    pub endpoints: Vec<RpcEndpointHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcAlert {
    pub alert_id: u64,
    pub severity: String,
    pub status: String,
    pub category: String,
    pub source: String,
    pub title: String,
    pub raised_at: i64,
    pub repeat_count: u32,
    pub escalation_level: u32,
}
