//! obscura-chain
//!
//! The chain facade: one uniform surface over heterogeneous ledgers.
//! Adapters own their wire formats and map every native failure into the
//! closed `ChainError` classification; the scheduler and session machine
//! consume only that classification, never chain-native errors.

pub mod account;
pub mod adapter;
pub mod confirm;
pub mod error;
pub mod facade;
pub mod fee;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod shielded;
pub mod throughput;
pub mod transport;
pub mod utxo;

pub use adapter::{BroadcastHandle, ChainAdapter, DepositSighting, FundingSource, TxIntent};
pub use confirm::{ConfirmationEvent, ConfirmationTracker};
pub use error::ChainError;
pub use facade::{ChainEvent, ChainFacade};
pub use fee::FeeEstimator;
pub use transport::RpcTransport;
