use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use obscura_core::error::MixError;
use tracing::{info, warn};

// ── RequestClass ─────────────────────────────────────────────────────────────

/// Transport selection is governed per request class, not per call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Web,
    Api,
    Blockchain,
    Admin,
    Monitoring,
}

impl RequestClass {
    pub const ALL: [RequestClass; 5] = [
        RequestClass::Web,
        RequestClass::Api,
        RequestClass::Blockchain,
        RequestClass::Admin,
        RequestClass::Monitoring,
    ];
}

// ── FailoverPolicy ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FailoverPolicy {
    pub primary: String,
    /// Admin-class requests carry no fallback and must error instead of
    /// degrading onto a weaker transport.
    pub fallback: Option<String>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub auto_recovery: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportChoice {
    Primary,
    Fallback,
}

#[derive(Debug)]
struct ClassState {
    active: TransportChoice,
    primary_ok_streak: u32,
}

// ── FailoverDirector ─────────────────────────────────────────────────────────

/// Chooses primary or fallback transport per request class, switches on
/// transport-shaped failures, and restores the primary after a healthy
/// probe streak when auto-recovery is on.
pub struct FailoverDirector {
    policies: HashMap<RequestClass, FailoverPolicy>,
    state: Mutex<HashMap<RequestClass, ClassState>>,
    recover_threshold: u32,
    emergency: AtomicBool,
}

/// Only transport-shaped failures trigger a switch.
fn is_transport_failure(err: &MixError) -> bool {
    matches!(
        err,
        MixError::Network(_) | MixError::ChainTimeout { .. } | MixError::ChainUnavailable { .. }
    )
}

impl FailoverDirector {
    pub fn new(
        policies: HashMap<RequestClass, FailoverPolicy>,
        recover_threshold: u32,
    ) -> Self {
        let state = policies
            .keys()
            .map(|&class| {
                (
                    class,
                    ClassState {
                        active: TransportChoice::Primary,
                        primary_ok_streak: 0,
                    },
                )
            })
            .collect();
        Self {
            policies,
            state: Mutex::new(state),
            recover_threshold,
            emergency: AtomicBool::new(false),
        }
    }

    /// Resolve the transport endpoint and timeout for a request class.
    pub fn route(&self, class: RequestClass) -> Result<(String, u64), MixError> {
        let policy = self
            .policies
            .get(&class)
            .ok_or_else(|| MixError::Config(format!("no failover policy for {class:?}")))?;

        let state = self.state.lock().expect("failover state lock");
        let choice = state
            .get(&class)
            .map(|s| s.active)
            .unwrap_or(TransportChoice::Primary);

        // Emergency mode force-switches everything with a fallback.
        let choice = if self.emergency.load(Ordering::Relaxed)
            && class != RequestClass::Admin
            && policy.fallback.is_some()
        {
            TransportChoice::Fallback
        } else {
            choice
        };

        match choice {
            TransportChoice::Primary => Ok((policy.primary.clone(), policy.timeout_ms)),
            TransportChoice::Fallback => policy
                .fallback
                .clone()
                .map(|f| (f, policy.timeout_ms))
                .ok_or_else(|| MixError::ChainProtocol("fallback routed with no fallback".into())),
        }
    }

    /// Report a request outcome. A transport failure on the primary causes
    /// an immediate switch iff a fallback exists; admin classes error.
    pub fn report_failure(&self, class: RequestClass, err: &MixError) -> Result<(), MixError> {
        if !is_transport_failure(err) {
            return Ok(());
        }
        let Some(policy) = self.policies.get(&class) else {
            return Ok(());
        };
        let mut state = self.state.lock().expect("failover state lock");
        let class_state = state.entry(class).or_insert(ClassState {
            active: TransportChoice::Primary,
            primary_ok_streak: 0,
        });
        class_state.primary_ok_streak = 0;

        if class_state.active == TransportChoice::Primary {
            match &policy.fallback {
                Some(fallback) => {
                    class_state.active = TransportChoice::Fallback;
                    warn!(?class, fallback, "primary transport failed — switching");
                    Ok(())
                }
                // No fallback: the caller must surface the error.
                None => Err(MixError::ChainProtocol(format!(
                    "{class:?} transport failed and has no fallback"
                ))),
            }
        } else {
            Ok(())
        }
    }

    /// Feed a primary-health probe result. After `recover_threshold`
    /// healthy probes, classes with auto-recovery switch back.
    pub fn record_primary_probe(&self, class: RequestClass, healthy: bool) {
        let Some(policy) = self.policies.get(&class) else {
            return;
        };
        if !policy.auto_recovery {
            return;
        }
        let mut state = self.state.lock().expect("failover state lock");
        let Some(class_state) = state.get_mut(&class) else {
            return;
        };
        if class_state.active != TransportChoice::Fallback {
            return;
        }
        if healthy {
            class_state.primary_ok_streak += 1;
            if class_state.primary_ok_streak >= self.recover_threshold {
                class_state.active = TransportChoice::Primary;
                class_state.primary_ok_streak = 0;
                info!(?class, "primary transport restored");
            }
        } else {
            class_state.primary_ok_streak = 0;
        }
    }

    /// Emergency failover: the primary cluster reported multiple or
    /// essential failures; every non-admin class moves to fallback.
    pub fn trigger_emergency(&self, reason: &str) {
        warn!(reason, "emergency failover engaged");
        self.emergency.store(true, Ordering::Relaxed);
    }

    pub fn clear_emergency(&self) {
        self.emergency.store(false, Ordering::Relaxed);
        info!("emergency failover cleared");
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    pub fn active_choice(&self, class: RequestClass) -> TransportChoice {
        self.state
            .lock()
            .expect("failover state lock")
            .get(&class)
            .map(|s| s.active)
            .unwrap_or(TransportChoice::Primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn director() -> FailoverDirector {
        let mut policies = HashMap::new();
        policies.insert(
            RequestClass::Blockchain,
            FailoverPolicy {
                primary: "tor".into(),
                fallback: Some("clearnet".into()),
                timeout_ms: 10_000,
                retries: 2,
                auto_recovery: true,
            },
        );
        policies.insert(
            RequestClass::Admin,
            FailoverPolicy {
                primary: "tor".into(),
                fallback: None,
                timeout_ms: 5_000,
                retries: 0,
                auto_recovery: false,
            },
        );
        FailoverDirector::new(policies, 2)
    }

    #[test]
    fn primary_failure_switches_to_fallback() {
        let d = director();
        let err = MixError::Network("refused".into());
        d.report_failure(RequestClass::Blockchain, &err).unwrap();
        assert_eq!(
            d.active_choice(RequestClass::Blockchain),
            TransportChoice::Fallback
        );
        let (endpoint, _) = d.route(RequestClass::Blockchain).unwrap();
        assert_eq!(endpoint, "clearnet");
    }

    #[test]
    fn admin_class_errors_instead_of_degrading() {
        let d = director();
        let err = MixError::ChainTimeout {
            operation: "probe".into(),
        };
        assert!(d.report_failure(RequestClass::Admin, &err).is_err());
        assert_eq!(d.active_choice(RequestClass::Admin), TransportChoice::Primary);
    }

    #[test]
    fn non_transport_errors_do_not_switch() {
        let d = director();
        let err = MixError::OutputSharesMismatch { got: 1 };
        d.report_failure(RequestClass::Blockchain, &err).unwrap();
        assert_eq!(
            d.active_choice(RequestClass::Blockchain),
            TransportChoice::Primary
        );
    }

    #[test]
    fn auto_recovery_after_probe_streak() {
        let d = director();
        d.report_failure(RequestClass::Blockchain, &MixError::Network("x".into()))
            .unwrap();
        d.record_primary_probe(RequestClass::Blockchain, true);
        assert_eq!(
            d.active_choice(RequestClass::Blockchain),
            TransportChoice::Fallback
        );
        d.record_primary_probe(RequestClass::Blockchain, true);
        assert_eq!(
            d.active_choice(RequestClass::Blockchain),
            TransportChoice::Primary
        );
    }

    #[test]
    fn failed_probe_resets_recovery_streak() {
        let d = director();
        d.report_failure(RequestClass::Blockchain, &MixError::Network("x".into()))
            .unwrap();
        d.record_primary_probe(RequestClass::Blockchain, true);
        d.record_primary_probe(RequestClass::Blockchain, false);
        d.record_primary_probe(RequestClass::Blockchain, true);
        assert_eq!(
            d.active_choice(RequestClass::Blockchain),
            TransportChoice::Fallback
        );
    }

    #[test]
    fn emergency_forces_fallback_for_non_admin() {
        let d = director();
        d.trigger_emergency("multiple_failures");
        let (endpoint, _) = d.route(RequestClass::Blockchain).unwrap();
        assert_eq!(endpoint, "clearnet");
        // Admin keeps its primary even in emergency.
        let (admin_endpoint, _) = d.route(RequestClass::Admin).unwrap();
        assert_eq!(admin_endpoint, "tor");
        d.clear_emergency();
        let (endpoint, _) = d.route(RequestClass::Blockchain).unwrap();
        assert_eq!(endpoint, "tor");
    }
}
