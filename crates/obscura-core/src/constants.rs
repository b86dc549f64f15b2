//! ─── Obscura Protocol Constants ─────────────────────────────────────────────
//!
//! Defaults for the mixing core. Anything with a config counterpart is a
//! default only; the config value wins at runtime.

// ── Shares & fees ────────────────────────────────────────────────────────────

/// Basis-point denominator. Output shares must sum to exactly this.
pub const BPS_DENOM: u32 = 10_000;

/// Default operator fee when the request does not name one (0.5 %).
pub const DEFAULT_FEE_BPS: u16 = 50;

/// Upper bound on the operator fee a request may ask for (5 %).
pub const MAX_FEE_BPS: u16 = 500;

/// Maximum outputs per session.
pub const MAX_OUTPUTS: usize = 8;

// ── Mixing policy ────────────────────────────────────────────────────────────

/// Minimum distinct non-self origins a selection must span (anonymity floor).
pub const DEFAULT_K_MIN: usize = 3;

/// Base release delay window (seconds), drawn uniformly.
pub const DEFAULT_MIN_DELAY_SECS: i64 = 600;
pub const DEFAULT_MAX_DELAY_SECS: i64 = 7_200;

/// Mean of the truncated-exponential inter-hop delay (seconds).
pub const DEFAULT_MEAN_HOP_DELAY_SECS: i64 = 900;

/// Truncation cap for a single inter-hop delay draw (seconds).
pub const DEFAULT_HOP_DELAY_CAP_SECS: i64 = 3_600;

/// Uniform jitter added to each hop's fire time (seconds).
pub const DEFAULT_JITTER_MAX_SECS: i64 = 120;

/// Session lifetime from creation to expiry when unconfigured (24 h).
pub const DEFAULT_SESSION_TTL_SECS: i64 = 86_400;

/// Reservation lease before unconsumed pool entries revert to available.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 900;

// ── Retry / backoff ──────────────────────────────────────────────────────────

/// Per-hop broadcast retry budget.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Fee-bump cap for RBF-capable chains: at most this many bumps per hop.
pub const DEFAULT_MAX_FEE_BUMPS: u32 = 3;

/// Each fee bump raises the rate by this percentage.
pub const FEE_BUMP_PERCENT: u64 = 25;

/// Exponential backoff for transient errors: base 1 s, cap 60 s.
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Jitter applied to backoff delays, ± this fraction of the delay.
pub const BACKOFF_JITTER_PERCENT: u64 = 20;

/// Linear retry delay cap for `execute_with_retry` (ms).
pub const RETRY_DELAY_CAP_MS: u64 = 30_000;

// ── Health / failover ────────────────────────────────────────────────────────

/// EWMA smoothing factor for endpoint latency.
pub const EWMA_ALPHA: f64 = 0.2;

/// Consecutive probe failures before an endpoint is marked Failed.
pub const HEALTH_FAIL_THRESHOLD: u32 = 3;

/// Consecutive probe successes before a Failed endpoint recovers.
pub const HEALTH_RECOVER_THRESHOLD: u32 = 3;

/// Health probe cadence (seconds).
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 15;

// ── Alerts ───────────────────────────────────────────────────────────────────

/// Default dedup cooldown for repeated alerts from one rule (seconds).
pub const DEFAULT_ALERT_COOLDOWN_SECS: i64 = 300;

/// Default per-(category, source, hour) rate limit.
pub const DEFAULT_ALERTS_MAX_PER_HOUR: u32 = 12;

/// Maximum escalation steps for an unresolved alert.
pub const MAX_ESCALATIONS: u32 = 3;

/// Unresolved error-severity alerts escalate after this long (seconds).
pub const DEFAULT_ESCALATION_DELAY_SECS: i64 = 900;

// ── Resource governor ────────────────────────────────────────────────────────

/// Memory sampling cadence (seconds).
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

/// Fraction of the memory budget that triggers a warning + cleanup pass.
pub const DEFAULT_HEAP_WARNING: f64 = 0.8;

/// Fraction of the memory budget that triggers emergency cleanup.
pub const DEFAULT_HEAP_CRITICAL: f64 = 0.9;

/// Emergency cleanup evicts at least half of every registered collection.
pub const EMERGENCY_EVICT_NUM: usize = 1;
pub const EMERGENCY_EVICT_DEN: usize = 2;

// ── Chain watching ───────────────────────────────────────────────────────────

/// Deposit poll cadence while awaiting a sighting (seconds).
pub const DEPOSIT_POLL_INTERVAL_SECS: u64 = 10;

/// Confirmation poll cadence for submitted broadcasts (seconds).
pub const CONFIRMATION_POLL_INTERVAL_SECS: u64 = 15;

/// Reorg watch window after DepositConfirmed, as a multiple of the
/// per-currency confirmation threshold.
pub const REORG_WINDOW_MULTIPLIER: u32 = 2;

/// Shielded operation polling: cadence and bounded timeout (seconds).
pub const SHIELDED_OP_POLL_INTERVAL_SECS: u64 = 5;
pub const SHIELDED_OP_TIMEOUT_SECS: u64 = 600;

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Wake slack: a hop may fire up to this early/late under nominal load (ms).
pub const SCHEDULER_WAKE_SLACK_MS: u64 = 1_000;

/// Capacity of the scheduler's inbound command channel.
pub const SCHEDULER_QUEUE_DEPTH: usize = 512;

/// Capacity of each per-session edge queue.
pub const SESSION_QUEUE_DEPTH: usize = 64;
