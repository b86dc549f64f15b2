//! obscura-crypto
//!
//! Hashing, per-session deposit keys, chain address derivation, and the
//! CSPRNG draws used by the scheduler. Key material is zeroed on drop; the
//! vault (obscura-store) owns at-rest sealing.

pub mod address;
pub mod hash;
pub mod keys;
pub mod rng;

pub use address::{derive_deposit_address, validate_address};
pub use hash::{blake3_hash, canonical_hash};
pub use keys::DepositKey;
