//! Sealed deposit-key vault.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under a store-local master key
//! before they touch disk. `destroy` overwrites the sealed row with zeros
//! and flushes before removing it, so terminal sessions leave no residue.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use obscura_core::error::MixError;
use obscura_core::types::SessionId;
use tracing::info;
use zeroize::Zeroizing;

const MASTER_KEY_META: &str = "vault_master_key";
const NONCE_LEN: usize = 12;

fn storage_err(e: sled::Error) -> MixError {
    MixError::Storage(e.to_string())
}

pub struct Vault {
    tree: sled::Tree,
    cipher: ChaCha20Poly1305,
}

impl Vault {
    /// Open the vault over its tree, creating the master key on first run.
    /// The master key lives in the meta tree beside the data it protects;
    /// operators who need a harder boundary mount an external keyfile.
    pub(crate) fn open(tree: sled::Tree, meta: &sled::Tree) -> Result<Self, MixError> {
        let key_bytes = match meta.get(MASTER_KEY_META).map_err(storage_err)? {
            Some(existing) => Zeroizing::new(existing.to_vec()),
            None => {
                let fresh = ChaCha20Poly1305::generate_key(&mut OsRng);
                meta.insert(MASTER_KEY_META, fresh.as_slice())
                    .map_err(storage_err)?;
                Zeroizing::new(fresh.to_vec())
            }
        };
        if key_bytes.len() != 32 {
            return Err(MixError::SealFailure);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Self { tree, cipher })
    }

    /// Seal and store a session's deposit secret.
    pub fn seal(&self, session: &SessionId, secret: &[u8]) -> Result<(), MixError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, secret)
            .map_err(|_| MixError::SealFailure)?;
        let mut row = Vec::with_capacity(NONCE_LEN + sealed.len());
        row.extend_from_slice(&nonce);
        row.extend_from_slice(&sealed);
        self.tree
            .insert(session.as_bytes(), row)
            .map_err(storage_err)?;
        Ok(())
    }

    /// Unseal a session's deposit secret.
    pub fn open_secret(&self, session: &SessionId) -> Result<Zeroizing<Vec<u8>>, MixError> {
        let row = self
            .tree
            .get(session.as_bytes())
            .map_err(storage_err)?
            .ok_or_else(|| MixError::VaultKeyMissing(session.to_hex()))?;
        if row.len() <= NONCE_LEN {
            return Err(MixError::SealFailure);
        }
        let (nonce, sealed) = row.split_at(NONCE_LEN);
        let secret = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| MixError::SealFailure)?;
        Ok(Zeroizing::new(secret))
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.tree.contains_key(session.as_bytes()).unwrap_or(false)
    }

    /// Destroy a session's key material: overwrite the sealed row with
    /// zeros, flush, then remove. Idempotent.
    pub fn destroy(&self, session: &SessionId) -> Result<(), MixError> {
        if let Some(row) = self.tree.get(session.as_bytes()).map_err(storage_err)? {
            let zeros = vec![0u8; row.len()];
            self.tree
                .insert(session.as_bytes(), zeros)
                .map_err(storage_err)?;
            self.tree.flush().map_err(storage_err)?;
            self.tree
                .remove(session.as_bytes())
                .map_err(storage_err)?;
            info!(session = %session, "deposit key destroyed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MixStore;

    fn temp_store(tag: &str) -> (MixStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("obscura_vault_{tag}"));
        let _ = std::fs::remove_dir_all(&dir);
        (MixStore::open(&dir).unwrap(), dir)
    }

    #[test]
    fn seal_open_round_trip() {
        let (store, dir) = temp_store("rt");
        let id = SessionId::from_bytes([5; 16]);
        store.vault().seal(&id, b"supersecret32bytes..............").unwrap();
        let secret = store.vault().open_secret(&id).unwrap();
        assert_eq!(&secret[..], b"supersecret32bytes..............");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn destroy_removes_and_is_idempotent() {
        let (store, dir) = temp_store("destroy");
        let id = SessionId::from_bytes([6; 16]);
        store.vault().seal(&id, b"k").unwrap();
        assert!(store.vault().contains(&id));
        store.vault().destroy(&id).unwrap();
        assert!(!store.vault().contains(&id));
        assert!(matches!(
            store.vault().open_secret(&id),
            Err(MixError::VaultKeyMissing(_))
        ));
        store.vault().destroy(&id).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sealed_rows_differ_from_plaintext() {
        let (store, dir) = temp_store("opaque");
        let id = SessionId::from_bytes([7; 16]);
        store.vault().seal(&id, b"plaintext-secret").unwrap();
        // Peek at the raw row: it must not contain the secret bytes.
        let raw = store.vault().tree.get(id.as_bytes()).unwrap().unwrap();
        let raw = raw.to_vec();
        assert!(!raw
            .windows(b"plaintext-secret".len())
            .any(|w| w == b"plaintext-secret"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
