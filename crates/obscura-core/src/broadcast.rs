use serde::{Deserialize, Serialize};

use crate::types::{Amount, BroadcastId, ChainTxId, Currency, SessionId, Timestamp};

// ── BroadcastStatus ──────────────────────────────────────────────────────────

/// Chain-write lifecycle: Pending → Submitted → Mempool → Confirmed(k) →
/// Final, or Rejected / Replaced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BroadcastStatus {
    Pending,
    Submitted,
    Mempool,
    Confirmed { count: u32 },
    Final,
    Rejected { reason: String, terminal: bool },
    Replaced { by: ChainTxId },
}

impl BroadcastStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Final
                | BroadcastStatus::Rejected { .. }
                | BroadcastStatus::Replaced { .. }
        )
    }
}

// ── Broadcast ────────────────────────────────────────────────────────────────

/// One chain-write attempt. `broadcast_id` is ours; `txid` is the chain's
/// reference once the write is accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Broadcast {
    pub broadcast_id: BroadcastId,
    pub currency: Currency,
    pub session_id: SessionId,
    pub hop_index: u32,
    pub amount: Amount,
    pub raw_tx: Vec<u8>,
    pub txid: Option<ChainTxId>,
    pub submitted_at: Option<Timestamp>,
    pub confirmations: u32,
    pub status: BroadcastStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(BroadcastStatus::Final.is_terminal());
        assert!(BroadcastStatus::Rejected {
            reason: "invalid".into(),
            terminal: true
        }
        .is_terminal());
        assert!(!BroadcastStatus::Confirmed { count: 2 }.is_terminal());
        assert!(!BroadcastStatus::Mempool.is_terminal());
    }
}
