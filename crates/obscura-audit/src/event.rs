use obscura_core::error::Severity;
use obscura_core::types::{SessionId, StreamId, Timestamp};
use obscura_crypto::hash::{blake3_hash, canonical_hash};
use serde::{Deserialize, Serialize};

// ── EventKind ────────────────────────────────────────────────────────────────

/// What class of operation an audit event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    StateTransition,
    BroadcastSubmitted,
    BroadcastSettled,
    PoolMutation,
    AlertRaised,
    AlertResolved,
    OperatorAction,
    KeyDestroyed,
    System,
}

// ── AuditEvent ───────────────────────────────────────────────────────────────

/// Append-only audit record. `event_id` is BLAKE3 of the canonical body
/// (everything except the id itself), so the chain link of the next event
/// (`prev_hash`) commits to this event in full.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_id: [u8; 32],
    pub stream: StreamId,
    /// Position within the stream (0-based, contiguous).
    pub seq: u64,
    pub timestamp: Timestamp,
    pub kind: EventKind,
    pub severity: Severity,
    pub component: String,
    pub operation: String,
    pub session_ref: Option<SessionId>,
    pub prev_hash: [u8; 32],
    pub payload_hash: [u8; 32],
    /// Canonical JSON payload string. Hashed, never interpreted here.
    pub payload: String,
}

/// The body covered by `event_id`. Mirrors the event minus the id field.
#[derive(Serialize)]
struct EventBody<'a> {
    stream: &'a StreamId,
    seq: u64,
    timestamp: Timestamp,
    kind: &'a EventKind,
    severity: &'a Severity,
    component: &'a str,
    operation: &'a str,
    session_ref: &'a Option<SessionId>,
    prev_hash: &'a [u8; 32],
    payload_hash: &'a [u8; 32],
    payload: &'a str,
}

impl AuditEvent {
    /// Build and seal a new event on top of `prev_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: StreamId,
        seq: u64,
        timestamp: Timestamp,
        kind: EventKind,
        severity: Severity,
        component: &str,
        operation: &str,
        session_ref: Option<SessionId>,
        prev_hash: [u8; 32],
        payload: String,
    ) -> Self {
        let payload_hash = blake3_hash(payload.as_bytes());
        let mut event = Self {
            event_id: [0u8; 32],
            stream,
            seq,
            timestamp,
            kind,
            severity,
            component: component.to_string(),
            operation: operation.to_string(),
            session_ref,
            prev_hash,
            payload_hash,
            payload,
        };
        event.event_id = event.compute_id();
        event
    }

    /// Recompute the id from the canonical body.
    pub fn compute_id(&self) -> [u8; 32] {
        canonical_hash(&EventBody {
            stream: &self.stream,
            seq: self.seq,
            timestamp: self.timestamp,
            kind: &self.kind,
            severity: &self.severity,
            component: &self.component,
            operation: &self.operation,
            session_ref: &self.session_ref,
            prev_hash: &self.prev_hash,
            payload_hash: &self.payload_hash,
            payload: &self.payload,
        })
    }

    /// Verify this event's internal integrity: id and payload hash both
    /// match their canonical recomputation.
    pub fn verify_integrity(&self) -> bool {
        self.event_id == self.compute_id()
            && self.payload_hash == blake3_hash(self.payload.as_bytes())
    }

    /// The chain link of a stream's first event.
    pub const GENESIS_HASH: [u8; 32] = [0u8; 32];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, prev: [u8; 32], payload: &str) -> AuditEvent {
        AuditEvent::new(
            StreamId::Global,
            seq,
            1_700_000_000,
            EventKind::OperatorAction,
            Severity::Low,
            "test",
            "noop",
            None,
            prev,
            payload.to_string(),
        )
    }

    #[test]
    fn id_matches_recomputation() {
        let e = event(0, AuditEvent::GENESIS_HASH, "{}");
        assert!(e.verify_integrity());
    }

    #[test]
    fn tampered_payload_detected() {
        let mut e = event(0, AuditEvent::GENESIS_HASH, r#"{"a":1}"#);
        e.payload = r#"{"a":2}"#.to_string();
        assert!(!e.verify_integrity());
    }

    #[test]
    fn tampered_seq_detected() {
        let mut e = event(3, AuditEvent::GENESIS_HASH, "{}");
        e.seq = 4;
        assert!(!e.verify_integrity());
    }

    #[test]
    fn chain_links_commit_to_predecessor() {
        let first = event(0, AuditEvent::GENESIS_HASH, "{}");
        let second = event(1, first.compute_id(), "{}");
        assert_eq!(second.prev_hash, first.event_id);
    }
}
