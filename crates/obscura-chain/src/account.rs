//! Account-chain adapter (Eth).
//!
//! Deposits are found by scanning new blocks for transfers into watched
//! addresses. Withdrawals are legacy RLP transactions signed locally
//! (EIP-155) and pushed through eth_sendRawTransaction. The adapter owns a
//! per-sender nonce cursor and holds its submission lock across
//! build-and-send, so one sender's transactions reach the wire in strictly
//! increasing nonce order with no gaps.

use std::collections::HashMap;

use async_trait::async_trait;
use obscura_core::types::{Address, Amount, ChainTxId, Currency};
use obscura_crypto::keys::DepositKey;
use obscura_crypto::validate_address;
use serde_json::json;
use sha3::{Digest, Keccak256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::adapter::{ChainAdapter, DepositSighting, TxIntent};
use crate::error::ChainError;
use crate::fee::FeeEstimator;

const GAS_LIMIT_TRANSFER: u64 = 21_000;
const WEI_PER_GWEI: u128 = 1_000_000_000;
/// Blocks scanned per deposit poll; bounds work when the cursor lags.
const MAX_BLOCKS_PER_SCAN: u64 = 20;

fn parse_hex_u64(v: &serde_json::Value) -> Option<u64> {
    let s = v.as_str()?.trim_start_matches("0x");
    u64::from_str_radix(s, 16).ok()
}

fn parse_hex_u128(v: &serde_json::Value) -> Option<u128> {
    let s = v.as_str()?.trim_start_matches("0x");
    u128::from_str_radix(s, 16).ok()
}

/// Big-endian with leading zeros trimmed — the canonical RLP integer form.
fn be_trim(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(16);
    bytes[start..].to_vec()
}

#[derive(Clone)]
struct SeenDeposit {
    txid: ChainTxId,
    amount: Amount,
    block: u64,
}

#[derive(Default)]
struct ScanState {
    last_scanned: u64,
    seen: HashMap<String, SeenDeposit>,
}

pub struct AccountAdapter {
    currency: Currency,
    transport: crate::transport::RpcTransport,
    fees: FeeEstimator,
    chain_id: u64,
    /// sender address → next nonce. Held across build+send so submissions
    /// for one sender serialize and nonces never gap.
    nonces: Mutex<HashMap<String, u64>>,
    scan: Mutex<ScanState>,
}

impl AccountAdapter {
    pub fn new(
        currency: Currency,
        transport: crate::transport::RpcTransport,
        fees: FeeEstimator,
        chain_id: u64,
    ) -> Self {
        Self {
            currency,
            transport,
            fees,
            chain_id,
            nonces: Mutex::new(HashMap::new()),
            scan: Mutex::new(ScanState::default()),
        }
    }

    fn classify(&self, err: ChainError) -> ChainError {
        let ChainError::Rpc { code, message } = err else {
            return err;
        };
        let lower = message.to_ascii_lowercase();
        if lower.contains("nonce too low") || lower.contains("underpriced") {
            ChainError::Rejected {
                reason: message,
                retryable: true,
            }
        } else if lower.contains("insufficient funds") || lower.contains("exceeds block gas") {
            ChainError::Rejected {
                reason: message,
                retryable: false,
            }
        } else {
            ChainError::Protocol(format!("rpc {code}: {message}"))
        }
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        let result = self
            .transport
            .call("eth_blockNumber", json!([]))
            .await
            .map_err(|e| self.classify(e))?;
        parse_hex_u64(&result)
            .ok_or_else(|| ChainError::Protocol("eth_blockNumber: bad hex".into()))
    }

    /// Build and EIP-155-sign a legacy transfer.
    fn sign_transfer(
        &self,
        signer: &DepositKey,
        nonce: u64,
        gas_price_wei: u128,
        to: &Address,
        value_wei: u128,
    ) -> Result<Vec<u8>, ChainError> {
        let to_bytes = hex::decode(to.as_str().trim_start_matches("0x"))
            .map_err(|_| ChainError::Protocol("recipient is not hex".into()))?;

        // Signing payload: (nonce, gasPrice, gas, to, value, data, chainId, 0, 0)
        let mut unsigned = rlp::RlpStream::new_list(9);
        unsigned.append(&be_trim(nonce as u128));
        unsigned.append(&be_trim(gas_price_wei));
        unsigned.append(&be_trim(GAS_LIMIT_TRANSFER as u128));
        unsigned.append(&to_bytes);
        unsigned.append(&be_trim(value_wei));
        unsigned.append(&Vec::<u8>::new());
        unsigned.append(&be_trim(self.chain_id as u128));
        unsigned.append(&Vec::<u8>::new());
        unsigned.append(&Vec::<u8>::new());
        let digest = Keccak256::digest(unsigned.out());

        let DepositKey::Secp256k1 { secret } = signer else {
            return Err(ChainError::Protocol(
                "account chain requires a secp256k1 signer".into(),
            ));
        };
        let sk = k256::ecdsa::SigningKey::from_bytes(secret.as_ref().into())
            .map_err(|e| ChainError::Protocol(e.to_string()))?;
        let (signature, recovery) = sk
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| ChainError::Protocol(e.to_string()))?;
        let sig_bytes = signature.to_bytes();
        let v = recovery.to_byte() as u128 + self.chain_id as u128 * 2 + 35;

        let mut signed = rlp::RlpStream::new_list(9);
        signed.append(&be_trim(nonce as u128));
        signed.append(&be_trim(gas_price_wei));
        signed.append(&be_trim(GAS_LIMIT_TRANSFER as u128));
        signed.append(&to_bytes);
        signed.append(&be_trim(value_wei));
        signed.append(&Vec::<u8>::new());
        signed.append(&be_trim(v));
        signed.append(&trim_leading_zeros(&sig_bytes[..32]));
        signed.append(&trim_leading_zeros(&sig_bytes[32..]));
        Ok(signed.out().to_vec())
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

#[async_trait]
impl ChainAdapter for AccountAdapter {
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
        let latest = self.latest_block().await?;
        let target = address.as_str().to_ascii_lowercase();
        let mut scan = self.scan.lock().await;

        // First poll starts from the chain tip; older history is not ours.
        if scan.last_scanned == 0 {
            scan.last_scanned = latest.saturating_sub(1);
        }

        let from = scan.last_scanned + 1;
        let to = latest.min(scan.last_scanned + MAX_BLOCKS_PER_SCAN);
        for number in from..=to {
            let block = self
                .transport
                .call(
                    "eth_getBlockByNumber",
                    json!([format!("0x{number:x}"), true]),
                )
                .await
                .map_err(|e| self.classify(e))?;
            let txs = block["transactions"].as_array().cloned().unwrap_or_default();
            for tx in txs {
                let to_addr = tx["to"].as_str().unwrap_or_default().to_ascii_lowercase();
                if to_addr != target {
                    continue;
                }
                let value = parse_hex_u128(&tx["value"]).unwrap_or(0);
                if value == 0 {
                    continue;
                }
                let txid = ChainTxId(tx["hash"].as_str().unwrap_or_default().to_string());
                scan.seen.insert(
                    target.clone(),
                    SeenDeposit {
                        txid,
                        amount: value,
                        block: number,
                    },
                );
            }
            scan.last_scanned = number;
        }

        Ok(scan.seen.get(&target).map(|d| DepositSighting {
            txid: d.txid.clone(),
            amount: d.amount,
            confirmations: (latest.saturating_sub(d.block) + 1) as u32,
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
                    "account broadcast needs exactly one funding input".into(),
                ))
            }
        };
        let sender = input.deposit_address.as_str().to_ascii_lowercase();
        let gas_price_wei = intent.fee_rate as u128 * WEI_PER_GWEI;

        // Cursor lock held across build+send: one sender, one nonce order.
        let mut nonces = self.nonces.lock().await;
        let nonce = match nonces.get(&sender) {
            Some(&n) => n,
            None => {
                let fetched = self
                    .transport
                    .call(
                        "eth_getTransactionCount",
                        json!([sender, "pending"]),
                    )
                    .await
                    .map_err(|e| self.classify(e))?;
                parse_hex_u64(&fetched)
                    .ok_or_else(|| ChainError::Protocol("transaction count: bad hex".into()))?
            }
        };

        let raw = self.sign_transfer(signer, nonce, gas_price_wei, &intent.to, intent.amount)?;
        let txid = ChainTxId(format!("0x{}", hex::encode(Keccak256::digest(&raw))));
        let raw_hex = format!("0x{}", hex::encode(&raw));

        match self
            .transport
            .call("eth_sendRawTransaction", json!([raw_hex]))
            .await
        {
            Ok(_) => {
                nonces.insert(sender, nonce + 1);
                debug!(currency = %self.currency, txid = %txid, nonce, "transaction broadcast");
                Ok(txid)
            }
            // The pool already holds this exact payload: our submit raced a
            // retry. The effect on chain is still exactly one.
            Err(ChainError::Rpc { message, .. })
                if message.to_ascii_lowercase().contains("already known") =>
            {
                nonces.insert(sender, nonce + 1);
                Ok(txid)
            }
            Err(e) => {
                // Stale cursor: force a refetch on the next attempt.
                let classified = self.classify(e);
                if matches!(&classified, ChainError::Rejected { reason, .. }
                    if reason.to_ascii_lowercase().contains("nonce too low"))
                {
                    nonces.remove(&sender);
                }
                Err(classified)
            }
        }
    }

    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError> {
        let receipt = self
            .transport
            .call("eth_getTransactionReceipt", json!([txid.as_str()]))
            .await
            .map_err(|e| self.classify(e))?;
        if receipt.is_null() {
            return Ok(0);
        }
        let Some(block) = parse_hex_u64(&receipt["blockNumber"]) else {
            return Ok(0);
        };
        let latest = self.latest_block().await?;
        Ok((latest.saturating_sub(block) + 1) as u32)
    }

    async fn probe(&self) -> Result<u64, ChainError> {
        self.latest_block().await
    }

    async fn estimate_fee(&self, conf_target: u32) -> Result<u64, ChainError> {
        match self.transport.call("eth_gasPrice", json!([])).await {
            Ok(price) => match parse_hex_u128(&price) {
                Some(wei) => Ok((wei / WEI_PER_GWEI).max(1) as u64),
                None => Ok(self.fees.rate_for_target(conf_target)),
            },
            Err(_) => Ok(self.fees.rate_for_target(conf_target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::types::ChainFamily;

    #[test]
    fn be_trim_is_canonical() {
        assert!(be_trim(0).is_empty());
        assert_eq!(be_trim(1), vec![1]);
        assert_eq!(be_trim(256), vec![1, 0]);
        assert_eq!(be_trim(21_000), vec![0x52, 0x08]);
    }

    #[test]
    fn signed_transfer_is_valid_rlp() {
        let adapter = AccountAdapter::new(
            Currency::Eth,
            crate::transport::RpcTransport::new("http://localhost:0", 1_000, None),
            FeeEstimator::new(Default::default()),
            1,
        );
        let key = DepositKey::generate(ChainFamily::Account);
        let to = Address("0x00000000000000000000000000000000000000aa".into());
        let raw = adapter
            .sign_transfer(&key, 0, 20 * WEI_PER_GWEI, &to, 1_000_000_000_000_000_000)
            .unwrap();

        let decoded = rlp::Rlp::new(&raw);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);
        // v encodes the chain id per EIP-155: 35/36 for chain 1.
        let v: Vec<u8> = decoded.at(6).unwrap().data().unwrap().to_vec();
        assert!(v == vec![35] || v == vec![36]);
    }

    #[test]
    fn nonce_errors_classified_retryable() {
        let adapter = AccountAdapter::new(
            Currency::Eth,
            crate::transport::RpcTransport::new("http://localhost:0", 1_000, None),
            FeeEstimator::new(Default::default()),
            1,
        );
        let e = adapter.classify(ChainError::Rpc {
            code: -32000,
            message: "nonce too low".into(),
        });
        assert!(matches!(e, ChainError::Rejected { retryable: true, .. }));
        let e = adapter.classify(ChainError::Rpc {
            code: -32000,
            message: "insufficient funds for gas * price + value".into(),
        });
        assert!(matches!(e, ChainError::Rejected { retryable: false, .. }));
    }
}
