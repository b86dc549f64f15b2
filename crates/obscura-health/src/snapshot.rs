use obscura_core::constants::{EWMA_ALPHA, HEALTH_FAIL_THRESHOLD, HEALTH_RECOVER_THRESHOLD};
use obscura_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── HealthStatus ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Failing but under the failure threshold; still usable with caution.
    Degraded,
    Failed,
    /// No probe has completed yet.
    Unknown,
}

// ── HealthSnapshot ───────────────────────────────────────────────────────────

/// Published view of one external endpoint's health.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub endpoint_id: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub ewma_latency_ms: f64,
    pub last_ok_at: Option<Timestamp>,
}

// ── HealthTracker ────────────────────────────────────────────────────────────

/// Per-endpoint scoring state, owned by that endpoint's probe fiber.
/// `consecutive_failures ≥ fail_threshold` ⇒ Failed; recovery needs
/// `recover_threshold` consecutive successes. Latency is EWMA-smoothed
/// with α = 0.2.
pub struct HealthTracker {
    snapshot: HealthSnapshot,
    fail_threshold: u32,
    recover_threshold: u32,
}

impl HealthTracker {
    pub fn new(endpoint_id: &str) -> Self {
        Self::with_thresholds(endpoint_id, HEALTH_FAIL_THRESHOLD, HEALTH_RECOVER_THRESHOLD)
    }

    pub fn with_thresholds(endpoint_id: &str, fail_threshold: u32, recover_threshold: u32) -> Self {
        Self {
            snapshot: HealthSnapshot {
                endpoint_id: endpoint_id.to_string(),
                status: HealthStatus::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                ewma_latency_ms: 0.0,
                last_ok_at: None,
            },
            fail_threshold,
            recover_threshold,
        }
    }

    pub fn record_success(&mut self, latency_ms: u64, now: Timestamp) -> HealthStatus {
        let s = &mut self.snapshot;
        s.consecutive_failures = 0;
        s.consecutive_successes += 1;
        s.last_ok_at = Some(now);
        s.ewma_latency_ms = if s.ewma_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * s.ewma_latency_ms
        };

        let next = match s.status {
            // A failed endpoint must prove itself over a full streak.
            HealthStatus::Failed if s.consecutive_successes < self.recover_threshold => {
                HealthStatus::Failed
            }
            HealthStatus::Failed => {
                info!(endpoint = %s.endpoint_id, "endpoint recovered");
                HealthStatus::Healthy
            }
            _ => HealthStatus::Healthy,
        };
        s.status = next;
        next
    }

    pub fn record_failure(&mut self, now: Timestamp) -> HealthStatus {
        let _ = now;
        let s = &mut self.snapshot;
        s.consecutive_successes = 0;
        s.consecutive_failures += 1;

        let next = if s.consecutive_failures >= self.fail_threshold {
            if s.status != HealthStatus::Failed {
                warn!(
                    endpoint = %s.endpoint_id,
                    failures = s.consecutive_failures,
                    "endpoint marked failed"
                );
            }
            HealthStatus::Failed
        } else {
            HealthStatus::Degraded
        };
        s.status = next;
        next
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.clone()
    }

    pub fn status(&self) -> HealthStatus {
        self.snapshot.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_after_threshold() {
        let mut t = HealthTracker::with_thresholds("ep", 3, 2);
        assert_eq!(t.record_failure(1), HealthStatus::Degraded);
        assert_eq!(t.record_failure(2), HealthStatus::Degraded);
        assert_eq!(t.record_failure(3), HealthStatus::Failed);
    }

    #[test]
    fn recovery_needs_full_streak() {
        let mut t = HealthTracker::with_thresholds("ep", 2, 3);
        t.record_failure(1);
        t.record_failure(2);
        assert_eq!(t.status(), HealthStatus::Failed);

        assert_eq!(t.record_success(10, 3), HealthStatus::Failed);
        assert_eq!(t.record_success(10, 4), HealthStatus::Failed);
        assert_eq!(t.record_success(10, 5), HealthStatus::Healthy);
    }

    #[test]
    fn interleaved_failure_resets_recovery_streak() {
        let mut t = HealthTracker::with_thresholds("ep", 2, 3);
        t.record_failure(1);
        t.record_failure(2);
        t.record_success(10, 3);
        t.record_success(10, 4);
        t.record_failure(5);
        t.record_success(10, 6);
        t.record_success(10, 7);
        assert_eq!(t.status(), HealthStatus::Failed);
        t.record_success(10, 8);
        assert_eq!(t.status(), HealthStatus::Healthy);
    }

    #[test]
    fn ewma_smooths_latency() {
        let mut t = HealthTracker::new("ep");
        t.record_success(100, 1);
        assert!((t.snapshot().ewma_latency_ms - 100.0).abs() < f64::EPSILON);
        t.record_success(200, 2);
        // 0.2 × 200 + 0.8 × 100 = 120
        assert!((t.snapshot().ewma_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn single_failure_only_degrades() {
        let mut t = HealthTracker::new("ep");
        t.record_success(10, 1);
        assert_eq!(t.record_failure(2), HealthStatus::Degraded);
        assert_eq!(t.record_success(10, 3), HealthStatus::Healthy);
    }
}
