use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use obscura_core::error::{MixError, Severity};
use obscura_core::types::{SessionId, StreamId, Timestamp};
use tracing::debug;

use crate::event::{AuditEvent, EventKind};

// ── Storage seam ─────────────────────────────────────────────────────────────

/// Durable append/scan surface the log writes through. Implemented by the
/// sled store; tests use an in-memory map.
pub trait AuditStore: Send + Sync {
    fn append(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MixError>;
    /// All rows under a prefix, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, MixError>;
    /// The last row under a prefix, if any.
    fn last_in_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, MixError>;
}

fn row_key(stream: &StreamId, seq: u64) -> Vec<u8> {
    let mut k = stream.key_prefix();
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

// ── AuditLog ─────────────────────────────────────────────────────────────────

/// The append-only log. Keeps an in-memory head (hash, next seq) per warm
/// stream; cold streams are re-headed from storage on first append.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    heads: Mutex<HashMap<StreamId, ([u8; 32], u64)>>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            heads: Mutex::new(HashMap::new()),
        }
    }

    /// Append one event to `stream`. Returns the sealed event.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        stream: StreamId,
        timestamp: Timestamp,
        kind: EventKind,
        severity: Severity,
        component: &str,
        operation: &str,
        session_ref: Option<SessionId>,
        payload: serde_json::Value,
    ) -> Result<AuditEvent, MixError> {
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| MixError::Internal("audit head lock poisoned".into()))?;

        let (prev_hash, seq) = match heads.get(&stream) {
            Some(&head) => head,
            None => self.load_head(&stream)?,
        };

        let event = AuditEvent::new(
            stream,
            seq,
            timestamp,
            kind,
            severity,
            component,
            operation,
            session_ref,
            prev_hash,
            payload.to_string(),
        );

        let bytes =
            bincode::serialize(&event).map_err(|e| MixError::Serialization(e.to_string()))?;
        self.store.append(row_key(&stream, seq), bytes)?;
        heads.insert(stream, (event.event_id, seq + 1));

        debug!(stream = %stream, seq, operation, "audit event appended");
        Ok(event)
    }

    fn load_head(&self, stream: &StreamId) -> Result<([u8; 32], u64), MixError> {
        match self.store.last_in_prefix(&stream.key_prefix())? {
            Some(bytes) => {
                let last: AuditEvent = bincode::deserialize(&bytes)
                    .map_err(|e| MixError::Serialization(e.to_string()))?;
                Ok((last.event_id, last.seq + 1))
            }
            None => Ok((AuditEvent::GENESIS_HASH, 0)),
        }
    }

    /// Read a full stream in order.
    pub fn read_stream(&self, stream: &StreamId) -> Result<Vec<AuditEvent>, MixError> {
        self.store
            .scan_prefix(&stream.key_prefix())?
            .iter()
            .map(|b| {
                bincode::deserialize(b).map_err(|e| MixError::Serialization(e.to_string()))
            })
            .collect()
    }

    /// Walk a stream and verify every link: contiguous seq, intact event
    /// ids, and `prev_hash` equal to the recomputed predecessor id.
    pub fn verify_stream(&self, stream: &StreamId) -> Result<u64, MixError> {
        let events = self.read_stream(stream)?;
        let mut expected_prev = AuditEvent::GENESIS_HASH;
        for (i, event) in events.iter().enumerate() {
            if event.seq != i as u64
                || !event.verify_integrity()
                || event.prev_hash != expected_prev
            {
                return Err(MixError::AuditChainBroken {
                    stream: stream.to_string(),
                    event: hex::encode(event.event_id),
                });
            }
            expected_prev = event.event_id;
        }
        Ok(events.len() as u64)
    }

    /// Export a stream as newline-delimited canonical JSON, preserving
    /// order and hash linkage.
    pub fn export_ndjson(&self, stream: &StreamId) -> Result<String, MixError> {
        let events = self.read_stream(stream)?;
        let mut out = String::new();
        for event in events {
            let line = serde_json::json!({
                "event_id": hex::encode(event.event_id),
                "stream": event.stream.to_string(),
                "seq": event.seq,
                "timestamp": event.timestamp,
                "kind": format!("{:?}", event.kind),
                "severity": format!("{:?}", event.severity),
                "component": event.component,
                "operation": event.operation,
                "session_ref": event.session_ref.map(|s| s.to_hex()),
                "prev_hash": hex::encode(event.prev_hash),
                "payload_hash": hex::encode(event.payload_hash),
                "payload": event.payload,
            });
            out.push_str(&line.to_string());
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemStore {
        rows: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    }

    impl AuditStore for MemStore {
        fn append(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MixError> {
            self.rows.lock().unwrap().insert(key, value);
            Ok(())
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, MixError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(_, v)| v.clone())
                .collect())
        }

        fn last_in_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, MixError> {
            Ok(self.scan_prefix(prefix)?.into_iter().next_back())
        }
    }

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemStore::default()))
    }

    fn append_n(log: &AuditLog, stream: StreamId, n: u64) {
        for i in 0..n {
            log.append(
                stream,
                1_700_000_000 + i as i64,
                EventKind::StateTransition,
                Severity::Low,
                "session",
                "edge",
                None,
                serde_json::json!({ "i": i }),
            )
            .unwrap();
        }
    }

    #[test]
    fn appended_stream_verifies() {
        let log = log();
        let stream = StreamId::Session(SessionId::from_bytes([7; 16]));
        append_n(&log, stream, 5);
        assert_eq!(log.verify_stream(&stream).unwrap(), 5);
    }

    #[test]
    fn streams_are_independent_chains() {
        let log = log();
        let a = StreamId::Session(SessionId::from_bytes([1; 16]));
        append_n(&log, a, 3);
        append_n(&log, StreamId::Global, 2);
        assert_eq!(log.verify_stream(&a).unwrap(), 3);
        assert_eq!(log.verify_stream(&StreamId::Global).unwrap(), 2);
    }

    #[test]
    fn head_survives_cold_restart() {
        let store = Arc::new(MemStore::default());
        let stream = StreamId::Global;
        {
            let log = AuditLog::new(Arc::clone(&store) as Arc<dyn AuditStore>);
            append_n(&log, stream, 3);
        }
        // Fresh log over the same store must continue the chain, not fork it.
        let log = AuditLog::new(store as Arc<dyn AuditStore>);
        append_n(&log, stream, 2);
        assert_eq!(log.verify_stream(&stream).unwrap(), 5);
    }

    #[test]
    fn tampered_row_breaks_verification() {
        let store = Arc::new(MemStore::default());
        let log = AuditLog::new(Arc::clone(&store) as Arc<dyn AuditStore>);
        let stream = StreamId::Global;
        append_n(&log, stream, 3);

        // Flip a byte in the middle row.
        {
            let mut rows = store.rows.lock().unwrap();
            let key = rows.keys().nth(1).unwrap().clone();
            let mut row = rows.get(&key).unwrap().clone();
            let last = row.len() - 1;
            row[last] ^= 0xFF;
            rows.insert(key, row);
        }
        assert!(matches!(
            log.verify_stream(&stream),
            Err(MixError::AuditChainBroken { .. })
        ));
    }

    #[test]
    fn ndjson_export_is_ordered() {
        let log = log();
        append_n(&log, StreamId::Global, 3);
        let out = log.export_ndjson(&StreamId::Global).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["seq"], i as u64);
        }
    }
}
