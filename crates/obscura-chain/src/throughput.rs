//! High-throughput account adapter (Sol).
//!
//! Slot-based confirmation model: a finalized transaction counts as one
//! confirmation and that is sufficient. Transactions are assembled locally
//! (legacy message format, system-program transfer) and signed with the
//! session's ed25519 key.

use async_trait::async_trait;
use obscura_core::types::{Address, Amount, ChainTxId, Currency};
use obscura_crypto::keys::DepositKey;
use obscura_crypto::validate_address;
use serde_json::json;
use tracing::debug;

use crate::adapter::{ChainAdapter, DepositSighting, TxIntent};
use crate::error::ChainError;
use crate::fee::FeeEstimator;

/// Shortvec length prefix used throughout the wire format.
fn encode_compact_u16(mut value: u16, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], ChainError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_| ChainError::Protocol(format!("bad base58 key: {s}")))?;
    if bytes.len() != 32 {
        return Err(ChainError::Protocol("key is not 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Legacy message for one system-program transfer.
fn transfer_message(
    from: &[u8; 32],
    to: &[u8; 32],
    recent_blockhash: &[u8; 32],
    lamports: u64,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(3 + 1 + 3 * 32 + 32 + 16);
    // Header: 1 required signature, 0 readonly signed, 1 readonly unsigned.
    msg.extend_from_slice(&[1, 0, 1]);
    // Account keys: payer, recipient, system program.
    encode_compact_u16(3, &mut msg);
    msg.extend_from_slice(from);
    msg.extend_from_slice(to);
    msg.extend_from_slice(&[0u8; 32]);
    msg.extend_from_slice(recent_blockhash);
    // One instruction: system transfer (index 2) of `lamports`.
    encode_compact_u16(1, &mut msg);
    msg.push(2); // program id index
    encode_compact_u16(2, &mut msg);
    msg.extend_from_slice(&[0, 1]);
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&2u32.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());
    encode_compact_u16(data.len() as u16, &mut msg);
    msg.extend_from_slice(&data);
    msg
}

pub struct ThroughputAdapter {
    currency: Currency,
    transport: crate::transport::RpcTransport,
    fees: FeeEstimator,
}

impl ThroughputAdapter {
    pub fn new(
        currency: Currency,
        transport: crate::transport::RpcTransport,
        fees: FeeEstimator,
    ) -> Self {
        Self {
            currency,
            transport,
            fees,
        }
    }

    fn classify(&self, err: ChainError) -> ChainError {
        let ChainError::Rpc { code, message } = err else {
            return err;
        };
        let lower = message.to_ascii_lowercase();
        if lower.contains("blockhash not found") {
            ChainError::Rejected {
                reason: message,
                retryable: true,
            }
        } else if lower.contains("insufficient") {
            ChainError::Rejected {
                reason: message,
                retryable: false,
            }
        } else {
            ChainError::Protocol(format!("rpc {code}: {message}"))
        }
    }

    async fn balance(&self, address: &Address, commitment: &str) -> Result<u64, ChainError> {
        let result = self
            .transport
            .call(
                "getBalance",
                json!([address.as_str(), { "commitment": commitment }]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        result["value"]
            .as_u64()
            .ok_or_else(|| ChainError::Protocol("getBalance: missing value".into()))
    }
}

#[async_trait]
impl ChainAdapter for ThroughputAdapter {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn validate_address(&self, address: &str) -> bool {
        validate_address(self.currency, address)
    }

    async fn check_deposit(
        &self,
        address: &Address,
        _expected: Amount,
    ) -> Result<Option<DepositSighting>, ChainError> {
        let confirmed = self.balance(address, "confirmed").await? as Amount;
        if confirmed == 0 {
            return Ok(None);
        }
        let finalized = self.balance(address, "finalized").await? as Amount;

        let signatures = self
            .transport
            .call(
                "getSignaturesForAddress",
                json!([address.as_str(), { "limit": 1 }]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        let signature = signatures
            .get(0)
            .and_then(|s| s["signature"].as_str())
            .unwrap_or_default()
            .to_string();

        Ok(Some(DepositSighting {
            txid: ChainTxId(signature),
            amount: confirmed,
            // Finality is binary on the slot model.
            confirmations: if finalized >= confirmed { 1 } else { 0 },
        }))
    }

    async fn broadcast(
        &self,
        intent: &TxIntent,
        signers: &[DepositKey],
    ) -> Result<ChainTxId, ChainError> {
        let (input, signer) = match (intent.inputs.first(), signers.first()) {
            (Some(i), Some(s)) => (i, s),
            _ => {
                return Err(ChainError::Protocol(
                    "transfer needs exactly one funding input".into(),
                ))
            }
        };
        let from = decode_key(input.deposit_address.as_str())?;
        let to = decode_key(intent.to.as_str())?;
        let lamports = u64::try_from(intent.amount)
            .map_err(|_| ChainError::Protocol("amount exceeds u64 lamports".into()))?;

        let blockhash_result = self
            .transport
            .call("getLatestBlockhash", json!([{ "commitment": "finalized" }]))
            .await
            .map_err(|e| self.classify(e))?;
        let blockhash_str = blockhash_result["value"]["blockhash"]
            .as_str()
            .ok_or_else(|| ChainError::Protocol("getLatestBlockhash: missing hash".into()))?;
        let blockhash = decode_key(blockhash_str)?;

        let message = transfer_message(&from, &to, &blockhash, lamports);
        let signature = signer
            .sign(&message)
            .map_err(|e| ChainError::Protocol(e.to_string()))?;

        let mut tx = Vec::with_capacity(1 + 64 + message.len());
        encode_compact_u16(1, &mut tx);
        tx.extend_from_slice(&signature);
        tx.extend_from_slice(&message);

        let result = self
            .transport
            .call(
                "sendTransaction",
                json!([bs58::encode(&tx).into_string(), { "encoding": "base58" }]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        let txid = result
            .as_str()
            .ok_or_else(|| ChainError::Protocol("sendTransaction: non-string".into()))?;
        debug!(currency = %self.currency, txid, "transfer submitted");
        Ok(ChainTxId(txid.to_string()))
    }

    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError> {
        let statuses = self
            .transport
            .call(
                "getSignatureStatuses",
                json!([[txid.as_str()], { "searchTransactionHistory": true }]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        let status = &statuses["value"][0];
        if status.is_null() {
            return Ok(0);
        }
        Ok(match status["confirmationStatus"].as_str() {
            Some("finalized") => 1,
            _ => 0,
        })
    }

    async fn probe(&self) -> Result<u64, ChainError> {
        let slot = self
            .transport
            .call("getSlot", json!([]))
            .await
            .map_err(|e| self.classify(e))?;
        slot.as_u64()
            .ok_or_else(|| ChainError::Protocol("getSlot: non-numeric".into()))
    }

    async fn estimate_fee(&self, conf_target: u32) -> Result<u64, ChainError> {
        // Per-signature lamport fee is protocol-flat; policy wins.
        Ok(self.fees.rate_for_target(conf_target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_u16_encoding() {
        let mut out = Vec::new();
        encode_compact_u16(0, &mut out);
        assert_eq!(out, vec![0]);
        out.clear();
        encode_compact_u16(0x7F, &mut out);
        assert_eq!(out, vec![0x7F]);
        out.clear();
        encode_compact_u16(0x80, &mut out);
        assert_eq!(out, vec![0x80, 0x01]);
        out.clear();
        encode_compact_u16(0x3FFF, &mut out);
        assert_eq!(out, vec![0xFF, 0x7F]);
    }

    #[test]
    fn transfer_message_layout() {
        let from = [1u8; 32];
        let to = [2u8; 32];
        let hash = [3u8; 32];
        let msg = transfer_message(&from, &to, &hash, 1_000_000_000);
        // Header.
        assert_eq!(&msg[..3], &[1, 0, 1]);
        // Three account keys follow the count byte.
        assert_eq!(msg[3], 3);
        assert_eq!(&msg[4..36], &from);
        assert_eq!(&msg[36..68], &to);
        assert_eq!(&msg[68..100], &[0u8; 32]);
        assert_eq!(&msg[100..132], &hash);
        // One instruction, system-transfer tag 2 in the data.
        assert_eq!(msg[132], 1);
        let data_start = msg.len() - 12;
        assert_eq!(&msg[data_start..data_start + 4], &2u32.to_le_bytes());
    }

    #[test]
    fn signed_transaction_verifies() {
        use obscura_core::types::ChainFamily;
        let key = DepositKey::generate(ChainFamily::HighThroughput);
        let msg = transfer_message(&[1u8; 32], &[2u8; 32], &[3u8; 32], 42);
        let sig = key.sign(&msg).unwrap();
        assert_eq!(sig.len(), 64);
    }
}
