//! Account+shielded adapter (Zec).
//!
//! Transparent deposits behave like the UTXO family. Sends go through the
//! node's shielded operation queue: z_sendmany returns an operation id
//! that is polled to completion with a bounded timeout, then surfaced as
//! the same uniform handle every other adapter returns.

use std::time::Duration;

use async_trait::async_trait;
use obscura_core::constants::{SHIELDED_OP_POLL_INTERVAL_SECS, SHIELDED_OP_TIMEOUT_SECS};
use obscura_core::types::{Address, Amount, ChainTxId, Currency};
use obscura_crypto::keys::DepositKey;
use obscura_crypto::validate_address;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::adapter::{ChainAdapter, DepositSighting, TxIntent};
use crate::error::ChainError;
use crate::fee::FeeEstimator;

const ZATS_PER_COIN: f64 = 100_000_000.0;

fn coins_to_minor(coins: f64) -> Amount {
    (coins * ZATS_PER_COIN).round() as Amount
}

fn minor_to_coins(minor: Amount) -> f64 {
    minor as f64 / ZATS_PER_COIN
}

fn to_wif(key: &DepositKey) -> String {
    let mut body = Vec::with_capacity(34);
    body.push(0x80);
    body.extend_from_slice(key.secret_bytes());
    body.push(0x01);
    let checksum = Sha256::digest(Sha256::digest(&body));
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

pub struct ShieldedAdapter {
    currency: Currency,
    transport: crate::transport::RpcTransport,
    fees: FeeEstimator,
}

impl ShieldedAdapter {
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
        match code {
            -28 => ChainError::Unavailable,
            -26 | -25 => {
                let retryable = message.to_ascii_lowercase().contains("fee");
                ChainError::Rejected {
                    reason: message,
                    retryable,
                }
            }
            _ => ChainError::Protocol(format!("rpc {code}: {message}")),
        }
    }

    /// Poll one shielded operation to completion. Bounded: times out as
    /// `Timeout` rather than waiting on the node forever.
    async fn await_operation(&self, opid: &str) -> Result<ChainTxId, ChainError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(SHIELDED_OP_TIMEOUT_SECS);
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Timeout {
                    operation: format!("z_getoperationstatus {opid}"),
                });
            }
            let status = self
                .transport
                .call("z_getoperationstatus", json!([[opid]]))
                .await
                .map_err(|e| self.classify(e))?;
            let entry = status.get(0).cloned().unwrap_or_default();
            match entry["status"].as_str() {
                Some("success") => {
                    let txid = entry["result"]["txid"]
                        .as_str()
                        .ok_or_else(|| ChainError::Protocol("operation without txid".into()))?;
                    return Ok(ChainTxId(txid.to_string()));
                }
                Some("failed") => {
                    let reason = entry["error"]["message"]
                        .as_str()
                        .unwrap_or("shielded operation failed")
                        .to_string();
                    let retryable = reason.to_ascii_lowercase().contains("fee");
                    return Err(ChainError::Rejected { reason, retryable });
                }
                // queued / executing
                _ => {
                    tokio::time::sleep(Duration::from_secs(SHIELDED_OP_POLL_INTERVAL_SECS))
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl ChainAdapter for ShieldedAdapter {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn validate_address(&self, address: &str) -> bool {
        validate_address(self.currency, address)
    }

    async fn check_deposit(
        &self,
        address: &Address,
        expected: Amount,
    ) -> Result<Option<DepositSighting>, ChainError> {
        let result = self
            .transport
            .call("listunspent", json!([0, 9_999_999, [address.as_str()]]))
            .await
            .map_err(|e| self.classify(e))?;
        let mut best: Option<DepositSighting> = None;
        for utxo in result.as_array().cloned().unwrap_or_default() {
            let amount = coins_to_minor(utxo["amount"].as_f64().unwrap_or(0.0));
            if amount != expected {
                continue;
            }
            let confirmations = utxo["confirmations"].as_u64().unwrap_or(0) as u32;
            if best
                .as_ref()
                .map_or(true, |b| confirmations > b.confirmations)
            {
                best = Some(DepositSighting {
                    txid: ChainTxId(utxo["txid"].as_str().unwrap_or_default().to_string()),
                    amount,
                    confirmations,
                });
            }
        }
        Ok(best)
    }

    async fn broadcast(
        &self,
        intent: &TxIntent,
        signers: &[DepositKey],
    ) -> Result<ChainTxId, ChainError> {
        let Some(input) = intent.inputs.first() else {
            return Err(ChainError::Protocol(
                "shielded broadcast needs a funding input".into(),
            ));
        };

        // The node signs; hand it the transparent keys without rescanning.
        for key in signers {
            self.transport
                .call("importprivkey", json!([to_wif(key), "", false]))
                .await
                .map_err(|e| self.classify(e))?;
        }

        let recipients = json!([{
            "address": intent.to.as_str(),
            "amount": minor_to_coins(intent.amount),
        }]);
        let opid = self
            .transport
            .call(
                "z_sendmany",
                json!([input.deposit_address.as_str(), recipients, 1]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        let opid = opid
            .as_str()
            .ok_or_else(|| ChainError::Protocol("z_sendmany: non-string opid".into()))?;
        debug!(currency = %self.currency, opid, "shielded operation queued");

        self.await_operation(opid).await
    }

    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError> {
        match self
            .transport
            .call("getrawtransaction", json!([txid.as_str(), 1]))
            .await
        {
            Ok(tx) => Ok(tx["confirmations"].as_u64().unwrap_or(0) as u32),
            Err(ChainError::Rpc { code: -5, .. }) => Ok(0),
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn probe(&self) -> Result<u64, ChainError> {
        let height = self
            .transport
            .call("getblockcount", json!([]))
            .await
            .map_err(|e| self.classify(e))?;
        height
            .as_u64()
            .ok_or_else(|| ChainError::Protocol("getblockcount: non-numeric".into()))
    }

    async fn estimate_fee(&self, conf_target: u32) -> Result<u64, ChainError> {
        // Flat conventional fee; the policy table is authoritative here.
        Ok(self.fees.rate_for_target(conf_target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zat_conversion_round_trips() {
        assert_eq!(coins_to_minor(1.0), 100_000_000);
        assert_eq!(coins_to_minor(minor_to_coins(123_456_789)), 123_456_789);
    }

    #[test]
    fn fee_failures_are_retryable() {
        let adapter = ShieldedAdapter::new(
            Currency::Zec,
            crate::transport::RpcTransport::new("http://localhost:0", 1_000, None),
            FeeEstimator::new(Default::default()),
        );
        let e = adapter.classify(ChainError::Rpc {
            code: -26,
            message: "tx fee too small".into(),
        });
        assert!(matches!(e, ChainError::Rejected { retryable: true, .. }));
    }
}
