//! obscura-pool
//!
//! The multi-currency liquidity pool: splits confirmed deposits into
//! standard denominations, holds the resulting inventory, and selects
//! outputs for sessions under the conservation, non-self-mix, and
//! anonymity-floor constraints.

pub mod ladder;
pub mod pool;

pub use ladder::DenominationLadder;
pub use pool::{LiquidityPool, Selection};
