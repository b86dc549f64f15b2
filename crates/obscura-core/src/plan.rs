use serde::{Deserialize, Serialize};

use crate::error::MixError;
use crate::types::{
    Address, Amount, ChainTxId, Currency, HopNonce, PoolEntryId, SessionId, Timestamp,
};

// ── HopStatus ────────────────────────────────────────────────────────────────

/// Per-hop lifecycle. The plan itself is immutable once persisted; only
/// these status fields advance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum HopStatus {
    Pending,
    Submitted {
        txid: ChainTxId,
        submitted_at: Timestamp,
    },
    Confirmed {
        confirmed_at: Timestamp,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl HopStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            HopStatus::Confirmed { .. } | HopStatus::Failed { .. } | HopStatus::Cancelled
        )
    }
}

// ── Hop ──────────────────────────────────────────────────────────────────────

/// One scheduled output within a session's release plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hop {
    pub hop_index: u32,
    pub to_address: Address,
    pub amount: Amount,
    /// Absolute fire time (Unix seconds). Monotone non-decreasing across
    /// the plan's hops.
    pub fire_at: Timestamp,
    pub nonce: HopNonce,
    pub status: HopStatus,
}

// ── ChangeOutput ─────────────────────────────────────────────────────────────

/// The fractional residual below the smallest denomination, released
/// directly to the session's pre-disclosed change address. Exists because
/// conservation must hold exactly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: Address,
    pub amount: Amount,
    pub nonce: HopNonce,
    pub status: HopStatus,
}

// ── ReleasePlan ──────────────────────────────────────────────────────────────

/// The ordered, timed output schedule for one session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleasePlan {
    pub session_id: SessionId,
    pub currency: Currency,
    pub hops: Vec<Hop>,
    /// Pool entries reserved to fund this plan. Components hold ids only
    /// and dereference through the pool store.
    pub reserved_entries: Vec<PoolEntryId>,
    pub change: Option<ChangeOutput>,
    pub created_at: Timestamp,
}

impl ReleasePlan {
    /// Total value this plan releases (hops + fractional change).
    pub fn planned_value(&self) -> Amount {
        let hops: Amount = self.hops.iter().map(|h| h.amount).sum();
        hops + self.change.as_ref().map(|c| c.amount).unwrap_or(0)
    }

    /// Check the two plan invariants: exact conservation against the
    /// session's mix value, and monotone non-decreasing fire times.
    pub fn validate(&self, mix_value: Amount) -> Result<(), MixError> {
        let planned = self.planned_value();
        if planned != mix_value {
            return Err(MixError::PlanNotConserving {
                planned,
                expected: mix_value,
            });
        }
        for pair in self.hops.windows(2) {
            if pair[1].fire_at < pair[0].fire_at {
                return Err(MixError::PlanNotMonotone);
            }
        }
        Ok(())
    }

    /// Earliest pending fire time, if any hop is still pending.
    pub fn next_fire_at(&self) -> Option<Timestamp> {
        self.hops
            .iter()
            .filter(|h| h.status == HopStatus::Pending)
            .map(|h| h.fire_at)
            .min()
    }

    pub fn all_settled(&self) -> bool {
        self.hops.iter().all(|h| h.status.is_settled())
    }

    /// Canonical encoding used for persistence and export.
    pub fn encode(&self) -> Result<Vec<u8>, MixError> {
        bincode::serialize(self).map_err(|e| MixError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MixError> {
        bincode::deserialize(bytes).map_err(|e| MixError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(i: u32, amount: Amount, fire_at: Timestamp) -> Hop {
        Hop {
            hop_index: i,
            to_address: Address(format!("addr-{i}")),
            amount,
            fire_at,
            nonce: HopNonce([i as u8; 16]),
            status: HopStatus::Pending,
        }
    }

    fn plan(hops: Vec<Hop>, change: Option<ChangeOutput>) -> ReleasePlan {
        ReleasePlan {
            session_id: SessionId::from_bytes([9; 16]),
            currency: Currency::Btc,
            hops,
            reserved_entries: vec![],
            change,
            created_at: 0,
        }
    }

    #[test]
    fn conservation_checked_exactly() {
        let p = plan(vec![hop(0, 693_000, 100), hop(1, 297_000, 200)], None);
        assert!(p.validate(990_000).is_ok());
        assert!(matches!(
            p.validate(990_001),
            Err(MixError::PlanNotConserving { .. })
        ));
    }

    #[test]
    fn change_counts_toward_conservation() {
        let p = plan(
            vec![hop(0, 900_000, 100)],
            Some(ChangeOutput {
                address: Address("change".into()),
                amount: 90_000,
                nonce: HopNonce([0xFF; 16]),
                status: HopStatus::Pending,
            }),
        );
        assert!(p.validate(990_000).is_ok());
    }

    #[test]
    fn monotone_fire_times_enforced() {
        let p = plan(vec![hop(0, 1, 200), hop(1, 1, 100)], None);
        assert!(matches!(p.validate(2), Err(MixError::PlanNotMonotone)));

        let eq = plan(vec![hop(0, 1, 200), hop(1, 1, 200)], None);
        assert!(eq.validate(2).is_ok());
    }

    #[test]
    fn encode_decode_round_trip() {
        let p = plan(vec![hop(0, 693_000, 100), hop(1, 297_000, 200)], None);
        let bytes = p.encode().unwrap();
        let back = ReleasePlan::decode(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn next_fire_skips_settled_hops() {
        let mut p = plan(vec![hop(0, 1, 100), hop(1, 1, 200)], None);
        p.hops[0].status = HopStatus::Confirmed { confirmed_at: 150 };
        assert_eq!(p.next_fire_at(), Some(200));
        p.hops[1].status = HopStatus::Cancelled;
        assert_eq!(p.next_fire_at(), None);
        assert!(p.all_settled());
    }
}
