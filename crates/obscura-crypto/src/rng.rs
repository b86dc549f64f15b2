//! CSPRNG draws for ids, nonces, and release-time randomization.
//!
//! Everything routes through `OsRng` — delay draws are part of the privacy
//! envelope and must not come from a seedable generator.

use obscura_core::types::{BroadcastId, HopNonce, PoolEntryId, SessionId};
use rand::rngs::OsRng;
use rand::Rng;

pub fn session_id() -> SessionId {
    let mut b = [0u8; 16];
    OsRng.fill(&mut b);
    SessionId::from_bytes(b)
}

pub fn pool_entry_id() -> PoolEntryId {
    let mut b = [0u8; 16];
    OsRng.fill(&mut b);
    PoolEntryId::from_bytes(b)
}

pub fn broadcast_id() -> BroadcastId {
    let mut b = [0u8; 16];
    OsRng.fill(&mut b);
    BroadcastId::from_bytes(b)
}

pub fn hop_nonce() -> HopNonce {
    let mut b = [0u8; 16];
    OsRng.fill(&mut b);
    HopNonce(b)
}

/// Uniform integer draw in `[min, max]` (inclusive). `min == max` is fine.
pub fn draw_uniform(min: i64, max: i64) -> i64 {
    if min >= max {
        return min;
    }
    OsRng.gen_range(min..=max)
}

/// Truncated-exponential draw with the given mean, clamped to `[0, cap]`.
/// Inverse-CDF sampling; the clamp keeps worst-case schedules bounded.
pub fn draw_trunc_exp(mean: i64, cap: i64) -> i64 {
    if mean <= 0 || cap <= 0 {
        return 0;
    }
    let u: f64 = OsRng.gen_range(f64::EPSILON..1.0);
    let draw = -(mean as f64) * u.ln();
    (draw as i64).clamp(0, cap)
}

/// Symmetric jitter: `value ± percent%`, never below zero.
pub fn jitter_ms(value: u64, percent: u64) -> u64 {
    if value == 0 || percent == 0 {
        return value;
    }
    let span = (value * percent / 100) as i64;
    let offset = OsRng.gen_range(-span..=span);
    (value as i64 + offset).max(0) as u64
}
