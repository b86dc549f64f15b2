use std::collections::HashMap;

use obscura_core::types::{BroadcastId, ChainTxId};
use tracing::{debug, info};

/// Emitted each time a watched broadcast's confirmation count changes.
#[derive(Debug, Clone)]
pub struct ConfirmationEvent {
    pub broadcast_id: BroadcastId,
    pub txid: ChainTxId,
    pub confirmations: u32,
    pub is_final: bool,
    /// Confirmations went backwards: the containing block was reorged out.
    pub reorged: bool,
}

/// Tracks confirmation counts for in-flight broadcasts and reports when
/// one crosses its threshold or regresses (reorg).
pub struct ConfirmationTracker {
    /// broadcast → (txid, last seen count, threshold)
    watched: HashMap<BroadcastId, (ChainTxId, u32, u32)>,
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self {
            watched: HashMap::new(),
        }
    }

    pub fn watch(&mut self, broadcast_id: BroadcastId, txid: ChainTxId, threshold: u32) {
        self.watched.insert(broadcast_id, (txid, 0, threshold));
    }

    pub fn unwatch(&mut self, broadcast_id: &BroadcastId) {
        self.watched.remove(broadcast_id);
    }

    /// Record the latest observed count for one broadcast. Returns an
    /// event when the count changed; finalized broadcasts are dropped
    /// from the watch set.
    pub fn record(
        &mut self,
        broadcast_id: &BroadcastId,
        observed: u32,
    ) -> Option<ConfirmationEvent> {
        let (txid, last, threshold) = self.watched.get_mut(broadcast_id)?;
        if observed == *last {
            return None;
        }
        let reorged = observed < *last;
        *last = observed;
        let is_final = observed >= *threshold;

        let event = ConfirmationEvent {
            broadcast_id: *broadcast_id,
            txid: txid.clone(),
            confirmations: observed,
            is_final,
            reorged,
        };
        if reorged {
            debug!(broadcast = %broadcast_id, observed, "confirmation count regressed");
        }
        if is_final {
            info!(broadcast = %broadcast_id, confirmations = observed, "broadcast final");
            self.watched.remove(broadcast_id);
        }
        Some(event)
    }

    pub fn pending(&self) -> Vec<(BroadcastId, ChainTxId)> {
        self.watched
            .iter()
            .map(|(id, (txid, _, _))| (*id, txid.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.watched.len()
    }
}

impl Default for ConfirmationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (BroadcastId, ChainTxId) {
        (
            BroadcastId::from_bytes([0xAB; 16]),
            ChainTxId("deadbeef".into()),
        )
    }

    #[test]
    fn threshold_finalizes_and_unwatches() {
        let (bid, txid) = ids();
        let mut tracker = ConfirmationTracker::new();
        tracker.watch(bid, txid, 3);

        let e1 = tracker.record(&bid, 1).unwrap();
        assert!(!e1.is_final);
        let e2 = tracker.record(&bid, 3).unwrap();
        assert!(e2.is_final);
        assert_eq!(tracker.pending_count(), 0);
        assert!(tracker.record(&bid, 4).is_none());
    }

    #[test]
    fn unchanged_count_emits_nothing() {
        let (bid, txid) = ids();
        let mut tracker = ConfirmationTracker::new();
        tracker.watch(bid, txid, 3);
        tracker.record(&bid, 1);
        assert!(tracker.record(&bid, 1).is_none());
    }

    #[test]
    fn regression_flags_reorg() {
        let (bid, txid) = ids();
        let mut tracker = ConfirmationTracker::new();
        tracker.watch(bid, txid, 6);
        tracker.record(&bid, 2);
        let e = tracker.record(&bid, 0).unwrap();
        assert!(e.reorged);
        assert!(!e.is_final);
        assert_eq!(tracker.pending_count(), 1);
    }
}
