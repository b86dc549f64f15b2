//! Deterministic in-process adapter for integration tests.
//!
//! Tests script deposits, confirmation counts, and failure injection;
//! broadcasts are recorded instead of hitting a node. Compiled only for
//! tests and the `mock` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use obscura_core::types::{Address, Amount, ChainTxId, Currency, HopNonce};
use obscura_crypto::keys::DepositKey;

use crate::adapter::{ChainAdapter, DepositSighting, TxIntent};
use crate::error::ChainError;

/// One recorded outgoing transfer.
#[derive(Clone, Debug)]
pub struct SentTx {
    pub to: Address,
    pub amount: Amount,
    pub nonce: HopNonce,
    pub txid: ChainTxId,
    pub fee_rate: u64,
}

#[derive(Default)]
struct MockState {
    deposits: HashMap<String, DepositSighting>,
    confirmations: HashMap<String, u32>,
    sent: Vec<SentTx>,
    reject_next: Option<(String, bool)>,
    next_txid: u64,
}

pub struct MockAdapter {
    currency: Currency,
    state: Mutex<MockState>,
    height: AtomicU64,
    unavailable: AtomicBool,
}

impl MockAdapter {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            state: Mutex::new(MockState::default()),
            height: AtomicU64::new(100),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Script a deposit arriving at `address`.
    pub fn fund(&self, address: &Address, amount: Amount, confirmations: u32) -> ChainTxId {
        let mut state = self.state.lock().unwrap();
        state.next_txid += 1;
        let txid = ChainTxId(format!("dep-{}-{}", self.currency, state.next_txid));
        state.deposits.insert(
            address.as_str().to_string(),
            DepositSighting {
                txid: txid.clone(),
                amount,
                confirmations,
            },
        );
        txid
    }

    /// Advance a scripted deposit's confirmation count.
    pub fn confirm_deposit(&self, address: &Address, confirmations: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(sighting) = state.deposits.get_mut(address.as_str()) {
            sighting.confirmations = confirmations;
        }
    }

    /// Remove a scripted deposit (reorg simulation).
    pub fn reorg_deposit(&self, address: &Address) {
        self.state
            .lock()
            .unwrap()
            .deposits
            .remove(address.as_str());
    }

    /// Set the confirmation count of a sent transaction.
    pub fn set_confirmations(&self, txid: &ChainTxId, confirmations: u32) {
        self.state
            .lock()
            .unwrap()
            .confirmations
            .insert(txid.as_str().to_string(), confirmations);
    }

    /// Make the next broadcast fail with a rejection.
    pub fn reject_next(&self, reason: &str, retryable: bool) {
        self.state.lock().unwrap().reject_next = Some((reason.to_string(), retryable));
    }

    /// Toggle probe failures.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChainAdapter for MockAdapter {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.is_empty()
    }

    async fn check_deposit(
        &self,
        address: &Address,
        _expected: Amount,
    ) -> Result<Option<DepositSighting>, ChainError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ChainError::Unavailable);
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .get(address.as_str())
            .cloned())
    }

    async fn broadcast(
        &self,
        intent: &TxIntent,
        _signers: &[DepositKey],
    ) -> Result<ChainTxId, ChainError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ChainError::Unavailable);
        }
        let mut state = self.state.lock().unwrap();
        if let Some((reason, retryable)) = state.reject_next.take() {
            return Err(ChainError::Rejected { reason, retryable });
        }
        state.next_txid += 1;
        let txid = ChainTxId(format!("tx-{}-{}", self.currency, state.next_txid));
        state.sent.push(SentTx {
            to: intent.to.clone(),
            amount: intent.amount,
            nonce: intent.nonce,
            txid: txid.clone(),
            fee_rate: intent.fee_rate,
        });
        state.confirmations.insert(txid.as_str().to_string(), 0);
        Ok(txid)
    }

    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ChainError::Unavailable);
        }
        Ok(*self
            .state
            .lock()
            .unwrap()
            .confirmations
            .get(txid.as_str())
            .unwrap_or(&0))
    }

    async fn probe(&self) -> Result<u64, ChainError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ChainError::Unavailable);
        }
        Ok(self.height.fetch_add(1, Ordering::Relaxed))
    }

    async fn estimate_fee(&self, _conf_target: u32) -> Result<u64, ChainError> {
        Ok(10)
    }
}
