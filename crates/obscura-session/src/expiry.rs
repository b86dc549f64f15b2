use std::sync::Arc;
use std::time::Duration;

use obscura_core::session::SessionState;
use obscura_govern::{ResourceGovernor, TimerKind};
use obscura_pool::LiquidityPool;
use tracing::warn;

use crate::machine::SessionManager;

/// Sweep cadence for session expiry and pool lease reaping.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Start the periodic expiry sweep: sessions past `expires_at` get an
/// expire edge, and pool reservation leases past their TTL revert to
/// available. Registered with the governor so shutdown clears it.
pub fn spawn_expiry_sweep(
    manager: Arc<SessionManager>,
    pool: Arc<LiquidityPool>,
    governor: &ResourceGovernor,
) {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();

            if let Err(e) = pool.expire_leases(now) {
                warn!(error = %e, "lease sweep failed");
            }

            let live = match manager.store().iter_live_sessions() {
                Ok(live) => live,
                Err(e) => {
                    warn!(error = %e, "expiry sweep could not list sessions");
                    continue;
                }
            };
            for session in live {
                let expired = session.is_expired(now)
                    && matches!(
                        session.state,
                        SessionState::Created
                            | SessionState::AwaitingDeposit
                            | SessionState::Pooled { .. }
                    );
                if expired {
                    manager.expire(session.session_id).await;
                }
            }
        }
    });
    governor.timers.register(
        "session-expiry-sweep",
        TimerKind::Interval,
        "expires overdue sessions and reaps pool leases",
        handle,
    );
}
