use serde::{Deserialize, Serialize};

use crate::constants::{BPS_DENOM, MAX_FEE_BPS, MAX_OUTPUTS};
use crate::error::MixError;
use crate::types::{Address, Amount, Bps, ChainTxId, Currency, SessionId, Timestamp};

// ── OutputSpec ───────────────────────────────────────────────────────────────

/// One user-supplied payout leg. Shares are basis points of the mixed value
/// and must sum to exactly 10000 across a session's outputs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    pub address: Address,
    pub share_bps: Bps,
    /// Optional user preference to push this leg later in the schedule
    /// (seconds added to the drawn delay). Advisory only.
    pub delay_hint: Option<i64>,
}

/// Validate the output set shape: count bounds and exact share sum.
/// Address validity is the chain facade's job and is checked separately.
pub fn validate_outputs(outputs: &[OutputSpec]) -> Result<(), MixError> {
    if outputs.is_empty() {
        return Err(MixError::NoOutputs);
    }
    if outputs.len() > MAX_OUTPUTS {
        return Err(MixError::TooManyOutputs {
            max: MAX_OUTPUTS,
            got: outputs.len(),
        });
    }
    let sum: u32 = outputs.iter().map(|o| o.share_bps as u32).sum();
    if sum != BPS_DENOM {
        return Err(MixError::OutputSharesMismatch { got: sum });
    }
    Ok(())
}

// ── FailureReason ────────────────────────────────────────────────────────────

/// Why a session landed in `Failed`. Exposed to users only as a coarse
/// status; the detail stays inside the trust boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// Deposit below the smallest denomination class.
    AmountTooSmall,
    /// Observed deposit did not exactly match the expected amount.
    AmountMismatch,
    /// A confirmed deposit was reorged out before release began.
    DepositReorged,
    /// A hop was terminally rejected after the retry budget.
    HopRejected,
    /// The chain facade reported an irrecoverable error.
    ChainFailure,
    /// Anything else; carries an internal detail string.
    Internal(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::AmountTooSmall => "amount_too_small",
            FailureReason::AmountMismatch => "amount_mismatch",
            FailureReason::DepositReorged => "deposit_reorged",
            FailureReason::HopRejected => "hop_rejected",
            FailureReason::ChainFailure => "chain_failure",
            FailureReason::Internal(_) => "internal",
        }
    }
}

// ── SessionState ─────────────────────────────────────────────────────────────

/// The session lifecycle. Only the state machine writes this field; every
/// transition is persisted and audited before the driving edge is
/// acknowledged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingDeposit,
    DepositDetected {
        txid: ChainTxId,
        seen_at: Timestamp,
    },
    DepositConfirmed {
        confirmations: u32,
    },
    Pooled {
        pooled_at: Timestamp,
    },
    Scheduled {
        scheduled_at: Timestamp,
    },
    Releasing {
        first_fired_at: Timestamp,
    },
    Completed {
        completed_at: Timestamp,
    },
    // ── Side branches ────────────────────────────────────────────────────────
    Expired {
        expired_at: Timestamp,
    },
    Failed {
        reason: FailureReason,
        failed_at: Timestamp,
    },
    Refunding {
        started_at: Timestamp,
    },
    Refunded {
        refunded_at: Timestamp,
        txid: ChainTxId,
    },
    Cancelled {
        cancelled_at: Timestamp,
    },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::AwaitingDeposit => "awaiting_deposit",
            SessionState::DepositDetected { .. } => "deposit_detected",
            SessionState::DepositConfirmed { .. } => "deposit_confirmed",
            SessionState::Pooled { .. } => "pooled",
            SessionState::Scheduled { .. } => "scheduled",
            SessionState::Releasing { .. } => "releasing",
            SessionState::Completed { .. } => "completed",
            SessionState::Expired { .. } => "expired",
            SessionState::Failed { .. } => "failed",
            SessionState::Refunding { .. } => "refunding",
            SessionState::Refunded { .. } => "refunded",
            SessionState::Cancelled { .. } => "cancelled",
        }
    }

    /// Terminal states release the session worker and trigger key erasure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed { .. }
                | SessionState::Expired { .. }
                | SessionState::Failed { .. }
                | SessionState::Refunded { .. }
                | SessionState::Cancelled { .. }
        )
    }

    /// Coarse user-visible status. Internal detail never leaves the trust
    /// boundary.
    pub fn public_status(&self) -> &'static str {
        match self {
            SessionState::Completed { .. } => "released",
            SessionState::Refunding { .. } | SessionState::Refunded { .. } => "refunded",
            SessionState::Failed { .. }
            | SessionState::Expired { .. }
            | SessionState::Cancelled { .. } => "failed",
            _ => "pending",
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One user mix request, from creation to terminal state. The session owns
/// its deposit address; the matching key material lives in the vault and is
/// destroyed when the session terminates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub currency: Currency,
    pub deposit_address: Address,
    pub expected_amount: Amount,
    pub outputs: Vec<OutputSpec>,
    pub fee_bps: Bps,
    /// Where a refund goes if the mix cannot complete. Required so the
    /// refund path never has to invent a destination.
    pub refund_address: Address,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub state: SessionState,
    pub deposit_txid: Option<ChainTxId>,
    pub deposit_confirmations: u32,
    /// Edge-processing attempt counter (transient retries).
    pub attempts: u32,
    /// Number of audit events appended to this session's stream.
    pub audit_len: u64,
}

impl Session {
    /// Operator fee in minor units: floor(expected × fee_bps / 10000).
    pub fn fee_amount(&self) -> Amount {
        self.expected_amount * self.fee_bps as u128 / BPS_DENOM as u128
    }

    /// Value entering the mix: expected − fee. Conservation (Σ outputs +
    /// fee = deposit) holds because the final hop absorbs rounding.
    pub fn mix_value(&self) -> Amount {
        self.expected_amount - self.fee_amount()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Validate a requested fee.
pub fn validate_fee_bps(fee_bps: Bps) -> Result<(), MixError> {
    if fee_bps > MAX_FEE_BPS {
        return Err(MixError::InvalidFeeBps {
            max: MAX_FEE_BPS,
            got: fee_bps,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(addr: &str, bps: Bps) -> OutputSpec {
        OutputSpec {
            address: Address(addr.into()),
            share_bps: bps,
            delay_hint: None,
        }
    }

    #[test]
    fn shares_must_sum_to_denominator() {
        let ok = vec![output("a", 7_000), output("b", 3_000)];
        assert!(validate_outputs(&ok).is_ok());

        let short = vec![output("a", 7_000), output("b", 2_999)];
        assert!(matches!(
            validate_outputs(&short),
            Err(MixError::OutputSharesMismatch { got: 9_999 })
        ));
    }

    #[test]
    fn output_count_bounds() {
        assert!(matches!(validate_outputs(&[]), Err(MixError::NoOutputs)));
        let too_many: Vec<_> = (0..9).map(|_| output("a", 1_111)).collect();
        assert!(matches!(
            validate_outputs(&too_many),
            Err(MixError::TooManyOutputs { .. })
        ));
    }

    #[test]
    fn fee_arithmetic_is_exact() {
        let s = Session {
            session_id: SessionId::from_bytes([1; 16]),
            currency: Currency::Btc,
            deposit_address: Address("addr".into()),
            expected_amount: 100_000_000,
            outputs: vec![output("x", 10_000)],
            fee_bps: 50,
            refund_address: Address("refund".into()),
            created_at: 0,
            expires_at: 86_400,
            state: SessionState::Created,
            deposit_txid: None,
            deposit_confirmations: 0,
            attempts: 0,
            audit_len: 0,
        };
        assert_eq!(s.fee_amount(), 500_000);
        assert_eq!(s.mix_value() + s.fee_amount(), s.expected_amount);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(SessionState::Completed { completed_at: 1 }.is_terminal());
        assert!(SessionState::Cancelled { cancelled_at: 1 }.is_terminal());
        assert!(!SessionState::AwaitingDeposit.is_terminal());
        assert!(!SessionState::Refunding { started_at: 1 }.is_terminal());
    }

    #[test]
    fn public_status_is_coarse() {
        assert_eq!(SessionState::AwaitingDeposit.public_status(), "pending");
        assert_eq!(
            SessionState::Failed {
                reason: FailureReason::HopRejected,
                failed_at: 1
            }
            .public_status(),
            "failed"
        );
        assert_eq!(
            SessionState::Completed { completed_at: 1 }.public_status(),
            "released"
        );
    }
}
