use obscura_core::error::MixError;
use obscura_core::types::Currency;
use thiserror::Error;

/// Uniform chain-failure classification. Every adapter maps its native
/// errors into exactly these kinds before anything crosses the facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {operation}")]
    Timeout { operation: String },

    #[error("rate limited by endpoint")]
    RateLimited,

    #[error("rejected ({reason}); retryable: {retryable}")]
    Rejected { reason: String, retryable: bool },

    #[error("endpoint unavailable")]
    Unavailable,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Raw JSON-RPC error envelope. Transport-internal; adapters classify
    /// it into one of the kinds above before returning.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl ChainError {
    /// Whether a retry could plausibly succeed without operator action.
    pub fn retryable(&self) -> bool {
        match self {
            ChainError::Network(_)
            | ChainError::Timeout { .. }
            | ChainError::RateLimited
            | ChainError::Unavailable => true,
            ChainError::Rejected { retryable, .. } => *retryable,
            ChainError::Protocol(_) | ChainError::Rpc { .. } => false,
        }
    }

    /// Lift into the workspace error for the given currency.
    pub fn into_mix(self, currency: Currency) -> MixError {
        match self {
            ChainError::Network(detail) => MixError::Network(detail),
            ChainError::Timeout { operation } => MixError::ChainTimeout { operation },
            ChainError::RateLimited => MixError::ChainRateLimited,
            ChainError::Rejected { reason, retryable } => MixError::BroadcastRejected {
                reason,
                terminal: !retryable,
            },
            ChainError::Unavailable => MixError::ChainUnavailable { currency },
            ChainError::Protocol(detail) => MixError::ChainProtocol(detail),
            ChainError::Rpc { code, message } => {
                MixError::ChainProtocol(format!("unclassified rpc error {code}: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert!(ChainError::Network("refused".into()).retryable());
        assert!(ChainError::RateLimited.retryable());
        assert!(ChainError::Unavailable.retryable());
    }

    #[test]
    fn rejection_retryability_is_explicit() {
        assert!(ChainError::Rejected {
            reason: "fee too low".into(),
            retryable: true
        }
        .retryable());
        assert!(!ChainError::Rejected {
            reason: "double spend".into(),
            retryable: false
        }
        .retryable());
    }

    #[test]
    fn terminal_rejection_maps_to_terminal_mix_error() {
        let e = ChainError::Rejected {
            reason: "invalid".into(),
            retryable: false,
        }
        .into_mix(Currency::Btc);
        assert!(matches!(
            e,
            MixError::BroadcastRejected { terminal: true, .. }
        ));
    }
}
