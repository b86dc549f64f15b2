use std::path::Path;

use obscura_audit::AuditStore;
use obscura_core::broadcast::Broadcast;
use obscura_core::error::MixError;
use obscura_core::plan::ReleasePlan;
use obscura_core::pool::PooledAmount;
use obscura_core::session::Session;
use obscura_core::types::{BroadcastId, Currency, PoolEntryId, SessionId};

use crate::vault::Vault;

/// Persistent mixing-state database backed by sled (pure-Rust, no C deps).
///
/// Named trees:
///   sessions    — SessionId bytes    → bincode(Session)
///   plans       — SessionId bytes    → bincode(ReleasePlan)
///   pool        — PoolEntryId bytes  → bincode(PooledAmount)
///   broadcasts  — BroadcastId bytes  → bincode(Broadcast)
///   audit       — stream prefix ++ seq be bytes → bincode(AuditEvent)
///   vault       — SessionId bytes    → nonce ++ sealed secret
///   meta        — utf8 key bytes     → raw bytes
pub struct MixStore {
    _db: sled::Db,
    sessions: sled::Tree,
    plans: sled::Tree,
    pool: sled::Tree,
    broadcasts: sled::Tree,
    audit: sled::Tree,
    meta: sled::Tree,
    vault: Vault,
}

fn storage_err(e: sled::Error) -> MixError {
    MixError::Storage(e.to_string())
}

fn ser_err(e: bincode::Error) -> MixError {
    MixError::Serialization(e.to_string())
}

impl MixStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MixError> {
        let db = sled::open(path).map_err(storage_err)?;
        let sessions = db.open_tree("sessions").map_err(storage_err)?;
        let plans = db.open_tree("plans").map_err(storage_err)?;
        let pool = db.open_tree("pool").map_err(storage_err)?;
        let broadcasts = db.open_tree("broadcasts").map_err(storage_err)?;
        let audit = db.open_tree("audit").map_err(storage_err)?;
        let meta = db.open_tree("meta").map_err(storage_err)?;
        let vault_tree = db.open_tree("vault").map_err(storage_err)?;
        let vault = Vault::open(vault_tree, &meta)?;
        Ok(Self {
            _db: db,
            sessions,
            plans,
            pool,
            broadcasts,
            audit,
            meta,
            vault,
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>, MixError> {
        match self.sessions.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_session(&self, session: &Session) -> Result<(), MixError> {
        let bytes = bincode::serialize(session).map_err(ser_err)?;
        self.sessions
            .insert(session.session_id.as_bytes(), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    /// Compare-and-swap session write: succeeds only if the stored row
    /// still equals `expected`. `None` expected means "must not exist".
    pub fn cas_session(
        &self,
        expected: Option<&Session>,
        new: &Session,
    ) -> Result<(), MixError> {
        let old_bytes = expected
            .map(|s| bincode::serialize(s).map_err(ser_err))
            .transpose()?;
        let new_bytes = bincode::serialize(new).map_err(ser_err)?;
        let swapped = self
            .sessions
            .compare_and_swap(
                new.session_id.as_bytes(),
                old_bytes,
                Some(new_bytes),
            )
            .map_err(storage_err)?;
        swapped.map_err(|_| MixError::CasConflict {
            key: new.session_id.to_hex(),
        })
    }

    pub fn iter_sessions(&self) -> Result<Vec<Session>, MixError> {
        let mut result = Vec::new();
        for item in self.sessions.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            result.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(result)
    }

    /// Sessions that are not in a terminal state (for crash recovery replay).
    pub fn iter_live_sessions(&self) -> Result<Vec<Session>, MixError> {
        Ok(self
            .iter_sessions()?
            .into_iter()
            .filter(|s| !s.state.is_terminal())
            .collect())
    }

    pub fn count_sessions(&self) -> u64 {
        self.sessions.len() as u64
    }

    // ── Release plans ────────────────────────────────────────────────────────

    pub fn get_plan(&self, id: &SessionId) -> Result<Option<ReleasePlan>, MixError> {
        match self.plans.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(ReleasePlan::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_plan(&self, plan: &ReleasePlan) -> Result<(), MixError> {
        self.plans
            .insert(plan.session_id.as_bytes(), plan.encode()?)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Pool entries ─────────────────────────────────────────────────────────

    pub fn get_pool_entry(&self, id: &PoolEntryId) -> Result<Option<PooledAmount>, MixError> {
        match self.pool.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_pool_entry(&self, entry: &PooledAmount) -> Result<(), MixError> {
        let bytes = bincode::serialize(entry).map_err(ser_err)?;
        self.pool
            .insert(entry.pool_entry_id.as_bytes(), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn remove_pool_entry(&self, id: &PoolEntryId) -> Result<(), MixError> {
        self.pool.remove(id.as_bytes()).map_err(storage_err)?;
        Ok(())
    }

    pub fn iter_pool(&self, currency: Option<Currency>) -> Result<Vec<PooledAmount>, MixError> {
        let mut result = Vec::new();
        for item in self.pool.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let entry: PooledAmount = bincode::deserialize(&bytes).map_err(ser_err)?;
            if currency.map_or(true, |c| entry.currency == c) {
                result.push(entry);
            }
        }
        Ok(result)
    }

    // ── Broadcasts ───────────────────────────────────────────────────────────

    pub fn get_broadcast(&self, id: &BroadcastId) -> Result<Option<Broadcast>, MixError> {
        match self.broadcasts.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_broadcast(&self, b: &Broadcast) -> Result<(), MixError> {
        let bytes = bincode::serialize(b).map_err(ser_err)?;
        self.broadcasts
            .insert(b.broadcast_id.as_bytes(), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn iter_broadcasts_for_session(
        &self,
        session: &SessionId,
    ) -> Result<Vec<Broadcast>, MixError> {
        let mut result = Vec::new();
        for item in self.broadcasts.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let b: Broadcast = bincode::deserialize(&bytes).map_err(ser_err)?;
            if b.session_id == *session {
                result.push(b);
            }
        }
        result.sort_by_key(|b| b.hop_index);
        Ok(result)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), MixError> {
        self.meta
            .insert(key.as_bytes(), value)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, MixError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(storage_err)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), MixError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }
}

// ── Audit rows ────────────────────────────────────────────────────────────────

impl AuditStore for MixStore {
    fn append(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MixError> {
        self.audit.insert(key, value).map_err(storage_err)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, MixError> {
        let mut rows = Vec::new();
        for item in self.audit.scan_prefix(prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            rows.push(bytes.to_vec());
        }
        Ok(rows)
    }

    fn last_in_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, MixError> {
        // Keys are prefix ++ big-endian seq, so the scan is already ordered.
        Ok(self.scan_prefix(prefix)?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::session::{OutputSpec, SessionState};
    use obscura_core::types::Address;

    fn temp_store(tag: &str) -> (MixStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("obscura_store_{tag}"));
        let _ = std::fs::remove_dir_all(&dir);
        (MixStore::open(&dir).unwrap(), dir)
    }

    fn session(id: u8) -> Session {
        Session {
            session_id: SessionId::from_bytes([id; 16]),
            currency: Currency::Btc,
            deposit_address: Address("dep".into()),
            expected_amount: 1_000_000,
            outputs: vec![OutputSpec {
                address: Address("out".into()),
                share_bps: 10_000,
                delay_hint: None,
            }],
            fee_bps: 50,
            refund_address: Address("refund".into()),
            created_at: 0,
            expires_at: 86_400,
            state: SessionState::Created,
            deposit_txid: None,
            deposit_confirmations: 0,
            attempts: 0,
            audit_len: 0,
        }
    }

    #[test]
    fn session_round_trip() {
        let (store, dir) = temp_store("session_rt");
        let s = session(1);
        store.put_session(&s).unwrap();
        let loaded = store.get_session(&s.session_id).unwrap().unwrap();
        assert_eq!(loaded.expected_amount, 1_000_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cas_rejects_stale_writer() {
        let (store, dir) = temp_store("cas");
        let s = session(2);
        store.cas_session(None, &s).unwrap();

        let mut fresh = s.clone();
        fresh.state = SessionState::AwaitingDeposit;
        store.cas_session(Some(&s), &fresh).unwrap();

        // A writer still holding the original version must lose.
        let mut stale = s.clone();
        stale.state = SessionState::Cancelled { cancelled_at: 9 };
        assert!(matches!(
            store.cas_session(Some(&s), &stale),
            Err(MixError::CasConflict { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn live_sessions_excludes_terminal() {
        let (store, dir) = temp_store("live");
        let mut a = session(3);
        a.state = SessionState::AwaitingDeposit;
        store.put_session(&a).unwrap();
        let mut b = session(4);
        b.state = SessionState::Completed { completed_at: 1 };
        store.put_session(&b).unwrap();
        let live = store.iter_live_sessions().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_id, a.session_id);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn audit_rows_scan_in_seq_order() {
        use obscura_core::types::StreamId;
        let (store, dir) = temp_store("audit_order");
        let stream = StreamId::Global;
        for seq in [2u64, 0, 1] {
            let mut key = stream.key_prefix();
            key.extend_from_slice(&seq.to_be_bytes());
            store.append(key, vec![seq as u8]).unwrap();
        }
        let rows = store.scan_prefix(&stream.key_prefix()).unwrap();
        assert_eq!(rows, vec![vec![0u8], vec![1], vec![2]]);
        assert_eq!(
            store.last_in_prefix(&stream.key_prefix()).unwrap(),
            Some(vec![2u8])
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
