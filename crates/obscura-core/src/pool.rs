use serde::{Deserialize, Serialize};

use crate::types::{Amount, Currency, PoolEntryId, SessionId, Timestamp};

// ── DenominationClass ────────────────────────────────────────────────────────

/// Index into a currency's denomination ladder (0 = smallest rung).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DenominationClass(pub u8);

// ── PoolEntryState ───────────────────────────────────────────────────────────

/// Reservation substate. Reserved entries revert to Available when their
/// lease expires without consumption.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolEntryState {
    Available,
    Reserved {
        session: SessionId,
        lease_expires_at: Timestamp,
    },
    /// Consumed by a broadcast; kept for audit until pruned.
    Spent {
        spent_at: Timestamp,
    },
}

// ── PooledAmount ─────────────────────────────────────────────────────────────

/// One unit of fungible inventory. `origin_session_id` exists only to
/// enforce non-self-mixing and is opaque to selection otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PooledAmount {
    pub pool_entry_id: PoolEntryId,
    pub currency: Currency,
    pub amount: Amount,
    pub origin_session_id: SessionId,
    /// Earliest time this entry may fund an output.
    pub available_at: Timestamp,
    pub denomination_class: DenominationClass,
    /// Residual below the smallest rung; never mixed, released directly to
    /// the origin session's change address.
    pub fractional: bool,
    pub state: PoolEntryState,
}

impl PooledAmount {
    pub fn is_available(&self, now: Timestamp) -> bool {
        self.state == PoolEntryState::Available && now >= self.available_at && !self.fractional
    }

    pub fn is_reserved_for(&self, session: &SessionId) -> bool {
        matches!(&self.state, PoolEntryState::Reserved { session: s, .. } if s == session)
    }

    pub fn lease_expired(&self, now: Timestamp) -> bool {
        matches!(&self.state, PoolEntryState::Reserved { lease_expires_at, .. } if now >= *lease_expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: PoolEntryState) -> PooledAmount {
        PooledAmount {
            pool_entry_id: PoolEntryId::from_bytes([1; 16]),
            currency: Currency::Btc,
            amount: 1_000_000,
            origin_session_id: SessionId::from_bytes([2; 16]),
            available_at: 100,
            denomination_class: DenominationClass(3),
            fractional: false,
            state,
        }
    }

    #[test]
    fn availability_respects_time_and_state() {
        let e = entry(PoolEntryState::Available);
        assert!(!e.is_available(50));
        assert!(e.is_available(100));

        let r = entry(PoolEntryState::Reserved {
            session: SessionId::from_bytes([3; 16]),
            lease_expires_at: 200,
        });
        assert!(!r.is_available(150));
        assert!(r.lease_expired(200));
        assert!(!r.lease_expired(199));
    }

    #[test]
    fn fractional_entries_never_mix() {
        let mut e = entry(PoolEntryState::Available);
        e.fractional = true;
        assert!(!e.is_available(1_000));
    }
}
