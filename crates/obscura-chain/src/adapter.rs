use async_trait::async_trait;
use obscura_core::types::{
    Address, Amount, BroadcastId, ChainTxId, Currency, HopNonce, SessionId,
};
use obscura_crypto::keys::DepositKey;

use crate::error::ChainError;

// ── Requests & results ───────────────────────────────────────────────────────

/// One funding input behind a hop: a deposit held at an address whose key
/// is in the vault. The facade resolves these from reserved pool entries
/// just in time; adapters never see pool internals.
#[derive(Clone, Debug)]
pub struct FundingSource {
    pub origin: SessionId,
    pub deposit_txid: ChainTxId,
    pub deposit_address: Address,
    pub amount: Amount,
}

/// A broadcast request for one hop.
#[derive(Clone, Debug)]
pub struct TxIntent {
    pub currency: Currency,
    pub session_id: SessionId,
    pub hop_index: u32,
    pub inputs: Vec<FundingSource>,
    pub to: Address,
    pub amount: Amount,
    /// Duplicate-broadcast suppression key: the facade returns the prior
    /// txid for a nonce it has already submitted.
    pub nonce: HopNonce,
    /// Fee rate in the chain's native unit (sat/vB, gwei, lamports).
    pub fee_rate: u64,
}

/// Uniform handle for a submitted chain write.
#[derive(Clone, Debug)]
pub struct BroadcastHandle {
    pub broadcast_id: BroadcastId,
    pub currency: Currency,
    pub txid: ChainTxId,
}

/// A deposit observed at a watched address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositSighting {
    pub txid: ChainTxId,
    pub amount: Amount,
    pub confirmations: u32,
}

// ── ChainAdapter ─────────────────────────────────────────────────────────────

/// The per-currency capability trait. Variants (UTXO, account,
/// account+shielded, high-throughput) implement the same surface; there is
/// no inheritance, only this seam.
///
/// Every method maps native failures to `ChainError` before returning —
/// callers never see chain-native error shapes.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn currency(&self) -> Currency;

    /// Syntactic + checksum validation of a user-supplied address.
    fn validate_address(&self, address: &str) -> bool;

    /// Hook for adapters whose node must be told about a new watch target
    /// (wallet import). Default: nothing to do.
    async fn register_watch(&self, _address: &Address) -> Result<(), ChainError> {
        Ok(())
    }

    /// Look for a deposit at `address`. Returns the best sighting (highest
    /// confirmations) if one exists; `expected` is advisory — amount
    /// matching is the session machine's policy, not the adapter's.
    async fn check_deposit(
        &self,
        address: &Address,
        expected: Amount,
    ) -> Result<Option<DepositSighting>, ChainError>;

    /// Build, sign, and broadcast one transaction. `signers` correspond
    /// 1:1 to `intent.inputs`.
    async fn broadcast(
        &self,
        intent: &TxIntent,
        signers: &[DepositKey],
    ) -> Result<ChainTxId, ChainError>;

    /// Current confirmation count for a transaction; 0 while in mempool.
    async fn confirmations(&self, txid: &ChainTxId) -> Result<u32, ChainError>;

    /// Lightweight liveness probe: latest block height or slot.
    async fn probe(&self) -> Result<u64, ChainError>;

    /// Fee rate for a confirmation target, in the chain's native unit.
    async fn estimate_fee(&self, conf_target: u32) -> Result<u64, ChainError>;
}
