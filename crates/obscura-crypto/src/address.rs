//! Chain address derivation and validation.
//!
//! UTXO family: hash160 (RIPEMD160 ∘ SHA256) of the compressed public key,
//! base58check with a per-chain version prefix. Account family: Keccak-256
//! of the uncompressed point, last 20 bytes, 0x-hex. High-throughput:
//! base-58 of the 32-byte ed25519 point.

use obscura_core::error::MixError;
use obscura_core::types::{Address, Currency};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::keys::DepositKey;

/// Base58check version prefixes (mainnet P2PKH-style).
fn version_prefix(currency: Currency) -> &'static [u8] {
    match currency {
        Currency::Btc => &[0x00],
        Currency::Ltc => &[0x30],
        // Transparent t-address, two-byte prefix.
        Currency::Zec => &[0x1C, 0xB8],
        Currency::Eth | Currency::Sol => &[],
    }
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(first));
    out
}

fn base58check_encode(prefix: &[u8], payload: &[u8]) -> String {
    let mut body = Vec::with_capacity(prefix.len() + payload.len() + 4);
    body.extend_from_slice(prefix);
    body.extend_from_slice(payload);
    let checksum = double_sha256(&body);
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

fn base58check_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = bs58::decode(s).into_vec().ok()?;
    if bytes.len() < 5 {
        return None;
    }
    let (body, checksum) = bytes.split_at(bytes.len() - 4);
    if double_sha256(body)[..4] != *checksum {
        return None;
    }
    Some(body.to_vec())
}

/// Derive the deposit address for a session's key on the given currency.
pub fn derive_deposit_address(
    currency: Currency,
    key: &DepositKey,
) -> Result<Address, MixError> {
    match currency {
        Currency::Btc | Currency::Ltc | Currency::Zec => {
            let pubkey = key.public_key_bytes()?;
            let h160 = hash160(&pubkey);
            Ok(Address(base58check_encode(
                version_prefix(currency),
                &h160,
            )))
        }
        Currency::Eth => {
            let pubkey = key.public_key_uncompressed()?;
            if pubkey.len() != 65 {
                return Err(MixError::KeyDerivation(
                    "account address needs an uncompressed secp256k1 point".into(),
                ));
            }
            // Skip the 0x04 tag; address = last 20 bytes of Keccak-256.
            let digest = Keccak256::digest(&pubkey[1..]);
            Ok(Address(format!("0x{}", hex::encode(&digest[12..]))))
        }
        Currency::Sol => {
            let pubkey = key.public_key_bytes()?;
            if pubkey.len() != 32 {
                return Err(MixError::KeyDerivation(
                    "high-throughput address needs an ed25519 point".into(),
                ));
            }
            Ok(Address(bs58::encode(pubkey).into_string()))
        }
    }
}

/// Syntactic + checksum validation of a user-supplied address.
pub fn validate_address(currency: Currency, s: &str) -> bool {
    match currency {
        Currency::Btc | Currency::Ltc | Currency::Zec => match base58check_decode(s) {
            Some(body) => {
                let prefix = version_prefix(currency);
                body.len() == prefix.len() + 20 && body.starts_with(prefix)
            }
            None => false,
        },
        Currency::Eth => {
            s.len() == 42
                && s.starts_with("0x")
                && s[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        Currency::Sol => bs58::decode(s)
            .into_vec()
            .map(|b| b.len() == 32)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::types::ChainFamily;

    #[test]
    fn derived_utxo_addresses_validate() {
        for currency in [Currency::Btc, Currency::Ltc, Currency::Zec] {
            let key = DepositKey::generate(ChainFamily::Utxo);
            let addr = derive_deposit_address(currency, &key).unwrap();
            assert!(
                validate_address(currency, addr.as_str()),
                "{currency} address {addr} should validate"
            );
        }
    }

    #[test]
    fn derived_account_address_validates() {
        let key = DepositKey::generate(ChainFamily::Account);
        let addr = derive_deposit_address(Currency::Eth, &key).unwrap();
        assert!(addr.as_str().starts_with("0x"));
        assert_eq!(addr.as_str().len(), 42);
        assert!(validate_address(Currency::Eth, addr.as_str()));
    }

    #[test]
    fn derived_high_throughput_address_validates() {
        let key = DepositKey::generate(ChainFamily::HighThroughput);
        let addr = derive_deposit_address(Currency::Sol, &key).unwrap();
        assert!(validate_address(Currency::Sol, addr.as_str()));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let key = DepositKey::generate(ChainFamily::Utxo);
        let addr = derive_deposit_address(Currency::Btc, &key).unwrap();
        let mut corrupted = addr.as_str().to_string();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '1' { '2' } else { '1' });
        assert!(!validate_address(Currency::Btc, &corrupted));
    }

    #[test]
    fn cross_currency_addresses_rejected() {
        let key = DepositKey::generate(ChainFamily::Utxo);
        let btc = derive_deposit_address(Currency::Btc, &key).unwrap();
        assert!(!validate_address(Currency::Ltc, btc.as_str()));
        assert!(!validate_address(Currency::Eth, btc.as_str()));
    }
}
