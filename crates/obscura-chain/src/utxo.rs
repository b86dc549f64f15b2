//! UTXO-chain adapter (Btc, Ltc).
//!
//! Deposits land at address-derived scripts watched through the node's
//! wallet; broadcasts go through createrawtransaction →
//! signrawtransactionwithkey → sendrawtransaction so the node owns
//! consensus serialization. Locktime is pinned to the current height
//! (anti-fee-sniping), matching what standard wallets emit.

use async_trait::async_trait;
use obscura_core::types::{Address, Amount, ChainTxId, Currency};
use obscura_crypto::keys::DepositKey;
use obscura_crypto::validate_address;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::adapter::{ChainAdapter, DepositSighting, TxIntent};
use crate::error::ChainError;
use crate::fee::FeeEstimator;

/// Minor units per coin on the UTXO chains we serve.
const SATS_PER_COIN: f64 = 100_000_000.0;

/// Conservative vsize estimate for fee math: P2PKH inputs and two outputs.
fn estimate_vsize(inputs: usize) -> u64 {
    (inputs as u64) * 148 + 2 * 34 + 10
}

fn wif_version(currency: Currency) -> u8 {
    match currency {
        Currency::Ltc => 0xB0,
        _ => 0x80,
    }
}

/// Private key in wallet import format for signrawtransactionwithkey.
fn to_wif(currency: Currency, key: &DepositKey) -> String {
    let mut body = Vec::with_capacity(34);
    body.push(wif_version(currency));
    body.extend_from_slice(key.secret_bytes());
    // Compressed-pubkey marker; address derivation uses compressed keys.
    body.push(0x01);
    let checksum = Sha256::digest(Sha256::digest(&body));
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

fn coins_to_minor(coins: f64) -> Amount {
    (coins * SATS_PER_COIN).round() as Amount
}

fn minor_to_coins(minor: Amount) -> f64 {
    minor as f64 / SATS_PER_COIN
}

pub struct UtxoAdapter {
    currency: Currency,
    transport: crate::transport::RpcTransport,
    fees: FeeEstimator,
}

impl UtxoAdapter {
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

    /// Register an address with the node's wallet (no rescan) so
    /// listunspent sees its outputs. Called at deposit provisioning.
    pub async fn import_address(&self, address: &Address) -> Result<(), ChainError> {
        self.transport
            .call(
                "importaddress",
                json!([address.as_str(), "", false]),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.classify(e))
    }

    async fn unspent_for(&self, address: &Address) -> Result<Vec<Value>, ChainError> {
        let result = self
            .transport
            .call(
                "listunspent",
                json!([0, 9_999_999, [address.as_str()]]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    /// Map a raw RPC error into the uniform classification. Fee-level
    /// rejections are retryable (bump and re-sign); conflicts and missing
    /// inputs are terminal.
    fn classify(&self, err: ChainError) -> ChainError {
        let ChainError::Rpc { code, message } = err else {
            return err;
        };
        let lower = message.to_ascii_lowercase();
        match code {
            // RPC_IN_WARMUP
            -28 => ChainError::Unavailable,
            // RPC_VERIFY_REJECTED / RPC_VERIFY_ERROR
            -26 | -25 => {
                let retryable = lower.contains("fee") || lower.contains("min relay");
                ChainError::Rejected {
                    reason: message,
                    retryable,
                }
            }
            // RPC_VERIFY_ALREADY_IN_CHAIN
            -27 => ChainError::Rejected {
                reason: message,
                retryable: false,
            },
            _ => ChainError::Protocol(format!("rpc {code}: {message}")),
        }
    }
}

#[async_trait]
impl ChainAdapter for UtxoAdapter {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn validate_address(&self, address: &str) -> bool {
        validate_address(self.currency, address)
    }

    async fn register_watch(&self, address: &Address) -> Result<(), ChainError> {
        self.import_address(address).await
    }

    async fn check_deposit(
        &self,
        address: &Address,
        _expected: Amount,
    ) -> Result<Option<DepositSighting>, ChainError> {
        let unspent = self.unspent_for(address).await?;
        let mut best: Option<DepositSighting> = None;
        for utxo in unspent {
            let amount = coins_to_minor(utxo["amount"].as_f64().unwrap_or(0.0));
            if amount == 0 {
                continue;
            }
            let confirmations = utxo["confirmations"].as_u64().unwrap_or(0) as u32;
            let txid = ChainTxId(utxo["txid"].as_str().unwrap_or_default().to_string());
            let better = best
                .as_ref()
                .map_or(true, |b| confirmations > b.confirmations);
            if better {
                best = Some(DepositSighting {
                    txid,
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
        // Resolve exact outpoints for every funding input.
        let mut outpoints = Vec::with_capacity(intent.inputs.len());
        let mut total_in: Amount = 0;
        for input in &intent.inputs {
            let unspent = self.unspent_for(&input.deposit_address).await?;
            let found = unspent.iter().find(|u| {
                u["txid"].as_str() == Some(input.deposit_txid.as_str())
                    && coins_to_minor(u["amount"].as_f64().unwrap_or(0.0)) == input.amount
            });
            let Some(utxo) = found else {
                return Err(ChainError::Rejected {
                    reason: format!("missing outpoint for {}", input.deposit_txid),
                    retryable: false,
                });
            };
            outpoints.push(json!({
                "txid": utxo["txid"],
                "vout": utxo["vout"],
            }));
            total_in += input.amount;
        }

        let fee = intent.fee_rate * estimate_vsize(intent.inputs.len());
        if total_in < intent.amount + fee as Amount {
            return Err(ChainError::Rejected {
                reason: "inputs do not cover amount plus network fee".into(),
                retryable: false,
            });
        }

        // Payout plus change back to the first funding address; the dust
        // remainder (if change would be dust) is left to the miners.
        let change = total_in - intent.amount - fee as Amount;
        let mut outputs = serde_json::Map::new();
        outputs.insert(
            intent.to.as_str().to_string(),
            json!(minor_to_coins(intent.amount)),
        );
        if change > 546 {
            outputs.insert(
                intent.inputs[0].deposit_address.as_str().to_string(),
                json!(minor_to_coins(change)),
            );
        }

        // Anti-fee-sniping: locktime at the current height.
        let height = self.probe().await?;
        let raw = self
            .transport
            .call(
                "createrawtransaction",
                json!([outpoints, outputs, height]),
            )
            .await
            .map_err(|e| self.classify(e))?;
        let raw_hex = raw
            .as_str()
            .ok_or_else(|| ChainError::Protocol("createrawtransaction: non-string".into()))?;

        let wifs: Vec<String> = signers.iter().map(|k| to_wif(self.currency, k)).collect();
        let signed = self
            .transport
            .call("signrawtransactionwithkey", json!([raw_hex, wifs]))
            .await
            .map_err(|e| self.classify(e))?;
        if signed["complete"].as_bool() != Some(true) {
            return Err(ChainError::Rejected {
                reason: "incomplete signature set".into(),
                retryable: false,
            });
        }
        let signed_hex = signed["hex"]
            .as_str()
            .ok_or_else(|| ChainError::Protocol("signrawtransactionwithkey: no hex".into()))?;

        let txid = self
            .transport
            .call("sendrawtransaction", json!([signed_hex]))
            .await
            .map_err(|e| self.classify(e))?;
        let txid = txid
            .as_str()
            .ok_or_else(|| ChainError::Protocol("sendrawtransaction: non-string".into()))?;
        debug!(currency = %self.currency, txid, "raw transaction broadcast");
        Ok(ChainTxId(txid.to_string()))
    }

    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError> {
        match self
            .transport
            .call("getrawtransaction", json!([txid.as_str(), true]))
            .await
        {
            Ok(tx) => Ok(tx["confirmations"].as_u64().unwrap_or(0) as u32),
            // Unknown to the node: evicted or not yet relayed.
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
        match self
            .transport
            .call("estimatesmartfee", json!([conf_target]))
            .await
        {
            Ok(est) => match est["feerate"].as_f64() {
                // BTC/kvB → sat/vB.
                Some(rate) => Ok(((rate * SATS_PER_COIN) / 1_000.0).ceil() as u64),
                None => Ok(self.fees.rate_for_target(conf_target)),
            },
            // The node cannot estimate (fresh chain): use the policy table.
            Err(_) => Ok(self.fees.rate_for_target(conf_target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::types::ChainFamily;

    #[test]
    fn wif_round_trips_base58check() {
        let key = DepositKey::generate(ChainFamily::Utxo);
        let wif = to_wif(Currency::Btc, &key);
        let decoded = bs58::decode(&wif).into_vec().unwrap();
        // version + 32 secret bytes + compression marker + 4 checksum.
        assert_eq!(decoded.len(), 38);
        assert_eq!(decoded[0], 0x80);
        assert_eq!(decoded[33], 0x01);
        let checksum = Sha256::digest(Sha256::digest(&decoded[..34]));
        assert_eq!(&decoded[34..], &checksum[..4]);
    }

    #[test]
    fn amount_conversion_is_exact_for_round_values() {
        assert_eq!(coins_to_minor(1.0), 100_000_000);
        assert_eq!(coins_to_minor(0.6930), 69_300_000);
        assert_eq!(minor_to_coins(100_000_000), 1.0);
    }

    #[test]
    fn fee_rejections_classified_retryable() {
        let adapter = UtxoAdapter::new(
            Currency::Btc,
            crate::transport::RpcTransport::new("http://localhost:0", 1_000, None),
            FeeEstimator::new(Default::default()),
        );
        let e = adapter.classify(ChainError::Rpc {
            code: -26,
            message: "min relay fee not met".into(),
        });
        assert!(matches!(e, ChainError::Rejected { retryable: true, .. }));

        let e = adapter.classify(ChainError::Rpc {
            code: -25,
            message: "missing inputs".into(),
        });
        assert!(matches!(e, ChainError::Rejected { retryable: false, .. }));

        let e = adapter.classify(ChainError::Rpc {
            code: -28,
            message: "loading block index".into(),
        });
        assert_eq!(e, ChainError::Unavailable);
    }

    #[test]
    fn vsize_scales_with_inputs() {
        assert!(estimate_vsize(2) > estimate_vsize(1));
    }
}
