use k256::ecdsa::signature::Signer as _;
use obscura_core::error::MixError;
use obscura_core::types::ChainFamily;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Per-session deposit key. One is generated for every session, lives
/// sealed in the vault, and is destroyed when the session terminates.
///
/// The secret bytes are held in `Zeroizing` so memory is wiped on drop.
pub enum DepositKey {
    /// secp256k1 — UTXO, account, and shielded-capable chains.
    Secp256k1 { secret: Zeroizing<[u8; 32]> },
    /// ed25519 — the high-throughput chain family.
    Ed25519 { secret: Zeroizing<[u8; 32]> },
}

impl DepositKey {
    /// Generate a fresh key for the given chain family.
    pub fn generate(family: ChainFamily) -> Self {
        match family {
            ChainFamily::HighThroughput => {
                let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
                Self::Ed25519 {
                    secret: Zeroizing::new(sk.to_bytes()),
                }
            }
            _ => {
                let sk = k256::ecdsa::SigningKey::random(&mut OsRng);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&sk.to_bytes());
                Self::Secp256k1 {
                    secret: Zeroizing::new(bytes),
                }
            }
        }
    }

    /// Restore from vault bytes.
    pub fn from_raw(family: ChainFamily, bytes: &[u8]) -> Result<Self, MixError> {
        if bytes.len() != 32 {
            return Err(MixError::KeyDerivation(format!(
                "expected 32 secret bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        match family {
            ChainFamily::HighThroughput => Ok(Self::Ed25519 {
                secret: Zeroizing::new(arr),
            }),
            _ => {
                // Reject out-of-range scalars up front.
                k256::ecdsa::SigningKey::from_bytes(&arr.into())
                    .map_err(|e| MixError::KeyDerivation(e.to_string()))?;
                Ok(Self::Secp256k1 {
                    secret: Zeroizing::new(arr),
                })
            }
        }
    }

    /// Raw secret bytes for vault sealing.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        match self {
            DepositKey::Secp256k1 { secret } | DepositKey::Ed25519 { secret } => secret,
        }
    }

    /// Compressed SEC1 (33 bytes) for secp256k1; 32-byte point for ed25519.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, MixError> {
        match self {
            DepositKey::Secp256k1 { secret } => {
                let sk = k256::ecdsa::SigningKey::from_bytes(secret.as_ref().into())
                    .map_err(|e| MixError::KeyDerivation(e.to_string()))?;
                Ok(sk
                    .verifying_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec())
            }
            DepositKey::Ed25519 { secret } => {
                let sk = ed25519_dalek::SigningKey::from_bytes(secret);
                Ok(sk.verifying_key().to_bytes().to_vec())
            }
        }
    }

    /// Uncompressed SEC1 (65 bytes). Account-chain address derivation needs
    /// the full point; ed25519 keys return their 32-byte form unchanged.
    pub fn public_key_uncompressed(&self) -> Result<Vec<u8>, MixError> {
        match self {
            DepositKey::Secp256k1 { secret } => {
                let sk = k256::ecdsa::SigningKey::from_bytes(secret.as_ref().into())
                    .map_err(|e| MixError::KeyDerivation(e.to_string()))?;
                Ok(sk
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec())
            }
            DepositKey::Ed25519 { .. } => self.public_key_bytes(),
        }
    }

    /// Sign a message. Used by adapters when spending a deposit.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MixError> {
        match self {
            DepositKey::Secp256k1 { secret } => {
                let sk = k256::ecdsa::SigningKey::from_bytes(secret.as_ref().into())
                    .map_err(|e| MixError::KeyDerivation(e.to_string()))?;
                let sig: k256::ecdsa::Signature = sk.sign(message);
                Ok(sig.to_vec())
            }
            DepositKey::Ed25519 { secret } => {
                let sk = ed25519_dalek::SigningKey::from_bytes(secret);
                use ed25519_dalek::Signer as _;
                Ok(sk.sign(message).to_bytes().to_vec())
            }
        }
    }
}

impl std::fmt::Debug for DepositKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepositKey::Secp256k1 { .. } => write!(f, "DepositKey::Secp256k1(..)"),
            DepositKey::Ed25519 { .. } => write!(f, "DepositKey::Ed25519(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secp_round_trip_through_raw_bytes() {
        let key = DepositKey::generate(ChainFamily::Utxo);
        let restored = DepositKey::from_raw(ChainFamily::Utxo, key.secret_bytes()).unwrap();
        assert_eq!(
            key.public_key_bytes().unwrap(),
            restored.public_key_bytes().unwrap()
        );
    }

    #[test]
    fn ed25519_round_trip_through_raw_bytes() {
        let key = DepositKey::generate(ChainFamily::HighThroughput);
        let restored =
            DepositKey::from_raw(ChainFamily::HighThroughput, key.secret_bytes()).unwrap();
        assert_eq!(
            key.public_key_bytes().unwrap(),
            restored.public_key_bytes().unwrap()
        );
    }

    #[test]
    fn rejects_short_secret() {
        assert!(DepositKey::from_raw(ChainFamily::Utxo, &[0u8; 16]).is_err());
    }

    #[test]
    fn signatures_are_produced() {
        let key = DepositKey::generate(ChainFamily::Account);
        let sig = key.sign(b"payload").unwrap();
        assert!(!sig.is_empty());
    }
}
