use obscura_core::session::SessionState;

/// The authoritative transition table. Forward edges follow the mixing
/// pipeline; the only back-edges are the failure and refund branches from
/// their defined predecessors. Everything else is rejected, which is what
/// makes re-applied edges no-ops.
pub fn can_transition(from: &SessionState, to: &SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        // ── Pipeline ─────────────────────────────────────────────────────────
        (Created, AwaitingDeposit) => true,
        (AwaitingDeposit, DepositDetected { .. }) => true,
        (DepositDetected { .. }, DepositConfirmed { .. }) => true,
        (DepositConfirmed { .. }, Pooled { .. }) => true,
        (Pooled { .. }, Scheduled { .. }) => true,
        (Scheduled { .. }, Releasing { .. }) => true,
        (Releasing { .. }, Completed { .. }) => true,

        // ── Expiry & cancellation ────────────────────────────────────────────
        (Created, Expired { .. }) | (AwaitingDeposit, Expired { .. }) => true,
        (Created, Cancelled { .. }) | (AwaitingDeposit, Cancelled { .. }) => true,

        // ── Refund branch ────────────────────────────────────────────────────
        // Mismatched deposits refund as soon as they are sighted; confirmed
        // or pooled funds refund on user cancel or anonymity timeout.
        (AwaitingDeposit, Refunding { .. }) => true,
        (DepositDetected { .. }, Refunding { .. }) => true,
        (DepositConfirmed { .. }, Refunding { .. }) => true,
        (Pooled { .. }, Refunding { .. }) => true,
        (Refunding { .. }, Refunded { .. }) => true,

        // ── Failure branch: any non-terminal state may fail ──────────────────
        (from, Failed { .. }) => !from.is_terminal(),

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::session::{FailureReason, SessionState::*};
    use obscura_core::types::ChainTxId;

    fn detected() -> SessionState {
        DepositDetected {
            txid: ChainTxId("t".into()),
            seen_at: 1,
        }
    }

    #[test]
    fn pipeline_moves_forward_only() {
        assert!(can_transition(&Created, &AwaitingDeposit));
        assert!(can_transition(&AwaitingDeposit, &detected()));
        assert!(can_transition(
            &detected(),
            &DepositConfirmed { confirmations: 3 }
        ));
        assert!(can_transition(
            &DepositConfirmed { confirmations: 3 },
            &Pooled { pooled_at: 1 }
        ));
        assert!(can_transition(
            &Pooled { pooled_at: 1 },
            &Scheduled { scheduled_at: 2 }
        ));
        assert!(can_transition(
            &Scheduled { scheduled_at: 2 },
            &Releasing { first_fired_at: 3 }
        ));
        assert!(can_transition(
            &Releasing { first_fired_at: 3 },
            &Completed { completed_at: 4 }
        ));

        // No skipping and no back-edges.
        assert!(!can_transition(&AwaitingDeposit, &Pooled { pooled_at: 1 }));
        assert!(!can_transition(&Pooled { pooled_at: 1 }, &AwaitingDeposit));
        assert!(!can_transition(
            &Completed { completed_at: 4 },
            &Releasing { first_fired_at: 3 }
        ));
    }

    #[test]
    fn any_live_state_may_fail() {
        let failed = Failed {
            reason: FailureReason::ChainFailure,
            failed_at: 9,
        };
        assert!(can_transition(&AwaitingDeposit, &failed));
        assert!(can_transition(&Releasing { first_fired_at: 1 }, &failed));
        // But terminal states stay terminal.
        assert!(!can_transition(&Completed { completed_at: 1 }, &failed));
        assert!(!can_transition(&Cancelled { cancelled_at: 1 }, &failed));
    }

    #[test]
    fn refund_only_from_defined_predecessors() {
        let refunding = Refunding { started_at: 1 };
        assert!(can_transition(&DepositConfirmed { confirmations: 3 }, &refunding));
        assert!(can_transition(&Pooled { pooled_at: 1 }, &refunding));
        assert!(!can_transition(&Releasing { first_fired_at: 1 }, &refunding));
        assert!(can_transition(
            &refunding,
            &Refunded {
                refunded_at: 2,
                txid: ChainTxId("r".into())
            }
        ));
    }

    #[test]
    fn reapplying_a_state_is_rejected() {
        assert!(!can_transition(&AwaitingDeposit, &AwaitingDeposit));
        assert!(!can_transition(&detected(), &detected()));
    }
}
