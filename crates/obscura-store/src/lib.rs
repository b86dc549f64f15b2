//! obscura-store
//!
//! Durable state behind the mixing core: a sled database with one named
//! tree per record family, compare-and-swap on session rows, the audit
//! rows the hash chain is persisted into, and the sealed key vault.

pub mod db;
pub mod vault;

pub use db::MixStore;
pub use vault::Vault;
