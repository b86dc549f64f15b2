use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Currency, SessionId, Timestamp};

// ── Taxonomy metadata ────────────────────────────────────────────────────────

/// Closed error-kind taxonomy. Retry and surfacing policy key off the kind,
/// never off the call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Validation,
    BusinessLogic,
    Persistence,
    Chain,
    Network,
    Crypto,
    Configuration,
    System,
    Mixing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the retry orchestrator is allowed to do with an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub can_recover: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub requires_manual: bool,
}

impl RecoveryPolicy {
    pub const fn none() -> Self {
        Self {
            can_recover: false,
            max_retries: 0,
            retry_delay_ms: 0,
            requires_manual: false,
        }
    }

    pub const fn manual() -> Self {
        Self {
            can_recover: false,
            max_retries: 0,
            retry_delay_ms: 0,
            requires_manual: true,
        }
    }

    pub const fn retry(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            can_recover: true,
            max_retries,
            retry_delay_ms,
            requires_manual: false,
        }
    }
}

/// Where an error happened. Attached to retry outcomes and audit payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub session_ref: Option<SessionId>,
    pub started_at: Timestamp,
}

impl ErrorContext {
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            session_ref: None,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn for_session(component: &str, operation: &str, session: SessionId) -> Self {
        Self {
            session_ref: Some(session),
            ..Self::new(component, operation)
        }
    }
}

// ── MixError ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MixError {
    // ── Validation ───────────────────────────────────────────────────────────
    #[error("output shares must sum to 10000 basis points; got {got}")]
    OutputSharesMismatch { got: u32 },

    #[error("too many outputs: max {max}, got {got}")]
    TooManyOutputs { max: usize, got: usize },

    #[error("at least one output is required")]
    NoOutputs,

    #[error("invalid {currency} address: {address}")]
    InvalidAddress { currency: Currency, address: String },

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("currency not enabled: {0}")]
    CurrencyDisabled(Currency),

    #[error("amount below minimum: need at least {min}, got {got}")]
    AmountBelowMinimum { min: u128, got: u128 },

    #[error("amount above maximum: cap {max}, got {got}")]
    AmountAboveMaximum { max: u128, got: u128 },

    #[error("fee must be between 0 and {max} bps; got {got}")]
    InvalidFeeBps { max: u16, got: u16 },

    #[error("refund address is required for this operation")]
    RefundAddressMissing,

    // ── Authentication / authorization (operator surface) ────────────────────
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("operation not permitted: {operation}")]
    NotAuthorized { operation: String },

    // ── Session lifecycle ────────────────────────────────────────────────────
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("session has expired")]
    SessionExpired,

    #[error("too late to cancel: funds are already in flight")]
    CancelTooLate,

    // ── Pool / selection ─────────────────────────────────────────────────────
    #[error("insufficient {currency} liquidity: need {need}, have {have}")]
    InsufficientLiquidity {
        currency: Currency,
        need: u128,
        have: u128,
    },

    #[error("insufficient anonymity set: need {need} distinct origins, got {got}")]
    InsufficientAnonymity { need: usize, got: usize },

    #[error("pool entry not found: {0}")]
    PoolEntryNotFound(String),

    #[error("pool entry already reserved: {0}")]
    EntryAlreadyReserved(String),

    #[error("deposit below smallest denomination: minimum {min}, got {got}")]
    AmountTooSmall { min: u128, got: u128 },

    #[error("deposit amount mismatch: expected {expected}, observed {observed}")]
    AmountMismatch { expected: u128, observed: u128 },

    // ── Scheduler / plan ─────────────────────────────────────────────────────
    #[error("release plan fire times must be monotone non-decreasing")]
    PlanNotMonotone,

    #[error("release plan does not conserve value: planned {planned}, expected {expected}")]
    PlanNotConserving { planned: u128, expected: u128 },

    #[error("hop {index} is not pending")]
    HopNotPending { index: u32 },

    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    // ── Chain ────────────────────────────────────────────────────────────────
    #[error("{currency} endpoint unavailable")]
    ChainUnavailable { currency: Currency },

    #[error("chain request timed out: {operation}")]
    ChainTimeout { operation: String },

    #[error("chain endpoint rate-limited")]
    ChainRateLimited,

    #[error("broadcast rejected ({reason}); terminal: {terminal}")]
    BroadcastRejected { reason: String, terminal: bool },

    #[error("chain protocol error: {0}")]
    ChainProtocol(String),

    #[error("network error: {0}")]
    Network(String),

    // ── Persistence ──────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("concurrent write conflict on {key}")]
    CasConflict { key: String },

    #[error("vault has no key material for session {0}")]
    VaultKeyMissing(String),

    // ── Crypto / audit ───────────────────────────────────────────────────────
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("vault seal/unseal failed")]
    SealFailure,

    #[error("audit chain broken in stream {stream} at event {event}")]
    AuditChainBroken { stream: String, event: String },

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no configuration for currency {0}")]
    MissingCurrencyConfig(Currency),

    // ── System ───────────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,

    #[error("shutting down")]
    Shutdown,

    #[error("backpressure: {0} is paused")]
    Backpressure(Currency),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MixError {
    /// Classify into the closed taxonomy. Retry/surfacing policy derives
    /// from this, never from matching variants at call sites.
    pub fn kind(&self) -> ErrorKind {
        use MixError::*;
        match self {
            OutputSharesMismatch { .. }
            | TooManyOutputs { .. }
            | NoOutputs
            | InvalidAddress { .. }
            | UnsupportedCurrency(_)
            | CurrencyDisabled(_)
            | AmountBelowMinimum { .. }
            | AmountAboveMaximum { .. }
            | InvalidFeeBps { .. }
            | RefundAddressMissing => ErrorKind::Validation,

            AuthenticationFailed(_) => ErrorKind::Authentication,
            NotAuthorized { .. } => ErrorKind::Authorization,

            SessionNotFound(_) | InvalidTransition { .. } | SessionExpired | CancelTooLate => {
                ErrorKind::BusinessLogic
            }

            InsufficientLiquidity { .. }
            | InsufficientAnonymity { .. }
            | PoolEntryNotFound(_)
            | EntryAlreadyReserved(_)
            | AmountTooSmall { .. }
            | AmountMismatch { .. }
            | PlanNotMonotone
            | PlanNotConserving { .. }
            | HopNotPending { .. }
            | RetryBudgetExhausted { .. } => ErrorKind::Mixing,

            ChainUnavailable { .. }
            | ChainTimeout { .. }
            | ChainRateLimited
            | BroadcastRejected { .. }
            | ChainProtocol(_) => ErrorKind::Chain,

            Network(_) => ErrorKind::Network,

            Storage(_) | Serialization(_) | CasConflict { .. } | VaultKeyMissing(_) => {
                ErrorKind::Persistence
            }

            KeyDerivation(_) | SealFailure | AuditChainBroken { .. } => ErrorKind::Crypto,

            Config(_) | MissingCurrencyConfig(_) => ErrorKind::Configuration,

            Cancelled | Shutdown | Backpressure(_) | Internal(_) => ErrorKind::System,
        }
    }

    pub fn severity(&self) -> Severity {
        use MixError::*;
        match self {
            AuditChainBroken { .. } | SealFailure => Severity::Critical,
            Internal(_) | VaultKeyMissing(_) | PlanNotConserving { .. } => Severity::Critical,
            BroadcastRejected { terminal: true, .. } | RetryBudgetExhausted { .. } => {
                Severity::High
            }
            ChainUnavailable { .. } | Storage(_) | CasConflict { .. } | KeyDerivation(_) => {
                Severity::High
            }
            ChainTimeout { .. }
            | ChainRateLimited
            | Network(_)
            | Backpressure(_)
            | InsufficientLiquidity { .. }
            | InsufficientAnonymity { .. }
            | Serialization(_) => Severity::Medium,
            Config(_) | MissingCurrencyConfig(_) => Severity::High,
            _ => Severity::Low,
        }
    }

    pub fn recovery(&self) -> RecoveryPolicy {
        use MixError::*;
        match self {
            // Transient: retried locally, never surfaced until budget is gone.
            Network(_) | ChainTimeout { .. } | ChainUnavailable { .. } => {
                RecoveryPolicy::retry(5, 1_000)
            }
            ChainRateLimited => RecoveryPolicy::retry(5, 5_000),
            Storage(_) | CasConflict { .. } => RecoveryPolicy::retry(3, 500),
            BroadcastRejected { terminal: false, .. } => RecoveryPolicy::retry(3, 2_000),

            // Selection shortfalls resolve as liquidity arrives; the caller
            // polls rather than retrying inline.
            InsufficientLiquidity { .. } | InsufficientAnonymity { .. } => RecoveryPolicy::none(),

            // Irrecoverable chain outcomes need an operator.
            BroadcastRejected { terminal: true, .. } | RetryBudgetExhausted { .. } => {
                RecoveryPolicy::manual()
            }
            AuditChainBroken { .. } | VaultKeyMissing(_) | PlanNotConserving { .. } => {
                RecoveryPolicy::manual()
            }

            _ => RecoveryPolicy::none(),
        }
    }

    /// True for errors that must terminate the process: continuing to mix
    /// in an undefined state is worse than going down.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::System
            && self.severity() == Severity::Critical
            && !self.recovery().can_recover
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recoverable() {
        let e = MixError::Network("connection refused".into());
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(e.recovery().can_recover);
    }

    #[test]
    fn terminal_rejection_requires_manual() {
        let e = MixError::BroadcastRejected {
            reason: "double spend".into(),
            terminal: true,
        };
        let r = e.recovery();
        assert!(!r.can_recover);
        assert!(r.requires_manual);
        assert_eq!(e.severity(), Severity::High);
    }

    #[test]
    fn validation_never_retries() {
        let e = MixError::OutputSharesMismatch { got: 9_999 };
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(!e.recovery().can_recover);
    }

    #[test]
    fn broken_audit_chain_is_critical() {
        let e = MixError::AuditChainBroken {
            stream: "global".into(),
            event: "deadbeef".into(),
        };
        assert_eq!(e.severity(), Severity::Critical);
    }
}
