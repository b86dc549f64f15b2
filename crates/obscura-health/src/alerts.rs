//! Rule-based alerting with dedup, rate limiting, escalation, and
//! maintenance mode.
//!
//! Dedup fingerprint: BLAKE3(rule_id || title || source), suppressing
//! repeats inside the rule's cooldown. Rate limiting keys on
//! `(category, source, hour)`. Emergency severity bypasses both.

use std::collections::HashMap;
use std::sync::Mutex;

use obscura_core::constants::{DEFAULT_ESCALATION_DELAY_SECS, MAX_ESCALATIONS};
use obscura_core::error::MixError;
use obscura_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Severity ─────────────────────────────────────────────────────────────────

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
    Emergency,
}

// ── Rules ────────────────────────────────────────────────────────────────────

/// A matching rule. `category` and `component` are exact-match filters when
/// set; `min_severity` gates everything below it.
#[derive(Clone, Debug)]
pub struct AlertRule {
    pub rule_id: String,
    pub category: Option<String>,
    pub component: Option<String>,
    pub min_severity: AlertSeverity,
    pub channels: Vec<String>,
    pub cooldown_secs: i64,
    pub max_per_hour: u32,
    /// Channel sets for escalation levels 1.. (level 0 uses `channels`).
    pub escalation: Vec<Vec<String>>,
}

impl AlertRule {
    fn matches(&self, category: &str, component: &str, severity: AlertSeverity) -> bool {
        severity >= self.min_severity
            && self.category.as_deref().map_or(true, |c| c == category)
            && self.component.as_deref().map_or(true, |c| c == component)
    }
}

// ── Active alerts ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub alert_id: u64,
    pub rule_id: String,
    pub category: String,
    pub source: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub detail: String,
    pub status: AlertStatus,
    pub raised_at: Timestamp,
    /// Repeats absorbed by dedup while this alert was active.
    pub repeat_count: u32,
    pub escalation_level: u32,
    pub last_escalated_at: Option<Timestamp>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
}

/// One delivery to a channel. Recorded so operators and tests can see what
/// went where; actual transport is the notifier adapter's concern.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub alert_id: u64,
    pub channel: String,
    pub at: Timestamp,
}

// ── AlertManager ─────────────────────────────────────────────────────────────

struct ManagerState {
    next_id: u64,
    /// fingerprint → (alert_id, last_raised_at)
    dedup: HashMap<[u8; 32], (u64, Timestamp)>,
    /// (category, source, hour) → count
    rate: HashMap<(String, String, i64), u32>,
    active: HashMap<u64, ActiveAlert>,
    deliveries: Vec<Delivery>,
    maintenance: bool,
    /// rule_id → suppressed-until
    suppressed_rules: HashMap<String, Timestamp>,
}

pub struct AlertManager {
    rules: Vec<AlertRule>,
    state: Mutex<ManagerState>,
    escalation_delay_secs: i64,
}

fn fingerprint(rule_id: &str, title: &str, source: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(source.as_bytes());
    *hasher.finalize().as_bytes()
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>, maintenance: bool) -> Self {
        Self {
            rules,
            state: Mutex::new(ManagerState {
                next_id: 1,
                dedup: HashMap::new(),
                rate: HashMap::new(),
                active: HashMap::new(),
                deliveries: Vec::new(),
                maintenance,
                suppressed_rules: HashMap::new(),
            }),
            escalation_delay_secs: DEFAULT_ESCALATION_DELAY_SECS,
        }
    }

    /// A catch-all default ruleset over the given channels.
    pub fn with_default_rules(channels: Vec<String>, cooldown_secs: i64, max_per_hour: u32) -> Self {
        Self::new(
            vec![AlertRule {
                rule_id: "default".into(),
                category: None,
                component: None,
                min_severity: AlertSeverity::Info,
                channels: channels.clone(),
                cooldown_secs,
                max_per_hour,
                escalation: vec![channels],
            }],
            false,
        )
    }

    /// Raise an alert. Returns the alert id, or `None` when the alert was
    /// deduplicated, rate-limited, suppressed, or matched no rule.
    pub fn raise(
        &self,
        category: &str,
        source: &str,
        severity: AlertSeverity,
        title: &str,
        detail: &str,
        now: Timestamp,
    ) -> Option<u64> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(category, source, severity))?
            .clone();

        let mut state = self.state.lock().expect("alert state lock");
        let emergency = severity == AlertSeverity::Emergency;

        // Maintenance mode suppresses everything below Emergency.
        if state.maintenance && !emergency {
            return None;
        }

        // Rule-level suppression window.
        if let Some(&until) = state.suppressed_rules.get(&rule.rule_id) {
            if now < until && !emergency {
                return None;
            }
        }

        // Dedup inside cooldown: bump the repeat counter instead.
        let fp = fingerprint(&rule.rule_id, title, source);
        if !emergency {
            if let Some(&(existing_id, last_at)) = state.dedup.get(&fp) {
                if now - last_at < rule.cooldown_secs {
                    if let Some(alert) = state.active.get_mut(&existing_id) {
                        alert.repeat_count += 1;
                    }
                    state.dedup.insert(fp, (existing_id, last_at));
                    return None;
                }
            }
        }

        // Rate limit per (category, source, hour).
        let hour = now.div_euclid(3_600);
        let rate_key = (category.to_string(), source.to_string(), hour);
        let count = state.rate.entry(rate_key).or_insert(0);
        if *count >= rule.max_per_hour && !emergency {
            return None;
        }
        *count += 1;

        let alert_id = state.next_id;
        state.next_id += 1;
        let alert = ActiveAlert {
            alert_id,
            rule_id: rule.rule_id.clone(),
            category: category.to_string(),
            source: source.to_string(),
            severity,
            title: title.to_string(),
            detail: detail.to_string(),
            status: AlertStatus::Active,
            raised_at: now,
            repeat_count: 0,
            escalation_level: 0,
            last_escalated_at: None,
            acknowledged_by: None,
            resolved_by: None,
        };
        state.dedup.insert(fp, (alert_id, now));
        state.active.insert(alert_id, alert);

        for channel in &rule.channels {
            state.deliveries.push(Delivery {
                alert_id,
                channel: channel.clone(),
                at: now,
            });
        }
        warn!(alert_id, category, source, ?severity, title, "alert raised");
        Some(alert_id)
    }

    /// Escalation pass. Unresolved alerts at Error or above escalate to the
    /// next channel set after the delay, up to `MAX_ESCALATIONS`.
    pub fn tick(&self, now: Timestamp) {
        let mut state = self.state.lock().expect("alert state lock");
        let mut escalations: Vec<(u64, Vec<String>)> = Vec::new();

        for alert in state.active.values_mut() {
            if alert.status != AlertStatus::Active || alert.severity < AlertSeverity::Error {
                continue;
            }
            if alert.escalation_level >= MAX_ESCALATIONS {
                continue;
            }
            let since = alert.last_escalated_at.unwrap_or(alert.raised_at);
            if now - since < self.escalation_delay_secs {
                continue;
            }
            let rule = self.rules.iter().find(|r| r.rule_id == alert.rule_id);
            let next_level = alert.escalation_level as usize;
            let channels = rule
                .and_then(|r| r.escalation.get(next_level))
                .cloned()
                .unwrap_or_default();
            if channels.is_empty() {
                continue;
            }
            alert.escalation_level += 1;
            alert.last_escalated_at = Some(now);
            escalations.push((alert.alert_id, channels));
        }

        for (alert_id, channels) in escalations {
            warn!(alert_id, "alert escalated");
            for channel in channels {
                state.deliveries.push(Delivery {
                    alert_id,
                    channel,
                    at: now,
                });
            }
        }
    }

    // ── Operator operations ──────────────────────────────────────────────────

    pub fn acknowledge(&self, alert_id: u64, actor: &str) -> Result<(), MixError> {
        let mut state = self.state.lock().expect("alert state lock");
        let alert = state
            .active
            .get_mut(&alert_id)
            .ok_or_else(|| MixError::SessionNotFound(format!("alert {alert_id}")))?;
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(actor.to_string());
        info!(alert_id, actor, "alert acknowledged");
        Ok(())
    }

    pub fn resolve(&self, alert_id: u64, actor: &str) -> Result<(), MixError> {
        let mut state = self.state.lock().expect("alert state lock");
        let alert = state
            .active
            .get_mut(&alert_id)
            .ok_or_else(|| MixError::SessionNotFound(format!("alert {alert_id}")))?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_by = Some(actor.to_string());
        info!(alert_id, actor, "alert resolved");
        Ok(())
    }

    pub fn suppress_rule(&self, rule_id: &str, duration_secs: i64, reason: &str, now: Timestamp) {
        let mut state = self.state.lock().expect("alert state lock");
        state
            .suppressed_rules
            .insert(rule_id.to_string(), now + duration_secs);
        info!(rule_id, duration_secs, reason, "rule suppressed");
    }

    /// Maintenance mode: suppress non-emergency raising and mark existing
    /// actives as suppressed.
    pub fn set_maintenance_mode(&self, on: bool, reason: &str) {
        let mut state = self.state.lock().expect("alert state lock");
        state.maintenance = on;
        if on {
            for alert in state.active.values_mut() {
                if alert.status == AlertStatus::Active
                    && alert.severity < AlertSeverity::Emergency
                {
                    alert.status = AlertStatus::Suppressed;
                }
            }
        }
        info!(on, reason, "maintenance mode changed");
    }

    pub fn maintenance_mode(&self) -> bool {
        self.state.lock().expect("alert state lock").maintenance
    }

    /// True when the channel is known to some rule (a cheap liveness test;
    /// transport-level checks belong to the notifier adapter).
    pub fn test_channel(&self, channel: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.channels.iter().any(|c| c == channel))
    }

    pub fn list_active(&self) -> Vec<ActiveAlert> {
        let state = self.state.lock().expect("alert state lock");
        let mut alerts: Vec<_> = state.active.values().cloned().collect();
        alerts.sort_by_key(|a| a.alert_id);
        alerts
    }

    pub fn get(&self, alert_id: u64) -> Option<ActiveAlert> {
        self.state
            .lock()
            .expect("alert state lock")
            .active
            .get(&alert_id)
            .cloned()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().expect("alert state lock").deliveries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        AlertManager::new(
            vec![AlertRule {
                rule_id: "chain".into(),
                category: Some("chain".into()),
                component: None,
                min_severity: AlertSeverity::Warning,
                channels: vec!["log".into()],
                cooldown_secs: 300,
                max_per_hour: 3,
                escalation: vec![vec!["pager".into()], vec!["phone".into()]],
            }],
            false,
        )
    }

    #[test]
    fn dedup_within_cooldown() {
        let m = manager();
        let first = m.raise("chain", "btc", AlertSeverity::Error, "endpoint down", "", 1_000);
        assert!(first.is_some());
        let dup = m.raise("chain", "btc", AlertSeverity::Error, "endpoint down", "", 1_100);
        assert!(dup.is_none());
        assert_eq!(m.get(first.unwrap()).unwrap().repeat_count, 1);

        // Past the cooldown the same alert raises fresh.
        let later = m.raise("chain", "btc", AlertSeverity::Error, "endpoint down", "", 1_400);
        assert!(later.is_some());
    }

    #[test]
    fn rate_limit_per_hour() {
        let m = manager();
        for i in 0..3 {
            assert!(m
                .raise("chain", "btc", AlertSeverity::Error, &format!("t{i}"), "", 1_000 + i)
                .is_some());
        }
        assert!(m
            .raise("chain", "btc", AlertSeverity::Error, "t3", "", 1_010)
            .is_none());
        // Next hour resets the bucket.
        assert!(m
            .raise("chain", "btc", AlertSeverity::Error, "t4", "", 5_000)
            .is_some());
    }

    #[test]
    fn emergency_bypasses_cooldown_and_rate() {
        let m = manager();
        for i in 0..5 {
            assert!(
                m.raise("chain", "btc", AlertSeverity::Emergency, "meltdown", "", 1_000 + i)
                    .is_some(),
                "emergency {i} must not be suppressed"
            );
        }
    }

    #[test]
    fn below_min_severity_matches_nothing() {
        let m = manager();
        assert!(m
            .raise("chain", "btc", AlertSeverity::Info, "fyi", "", 1_000)
            .is_none());
    }

    #[test]
    fn escalation_walks_the_ladder() {
        let m = manager();
        let id = m
            .raise("chain", "btc", AlertSeverity::Error, "down", "", 0)
            .unwrap();
        m.tick(DEFAULT_ESCALATION_DELAY_SECS + 1);
        assert_eq!(m.get(id).unwrap().escalation_level, 1);
        m.tick(2 * DEFAULT_ESCALATION_DELAY_SECS + 2);
        assert_eq!(m.get(id).unwrap().escalation_level, 2);
        // No third level configured; level stays.
        m.tick(10 * DEFAULT_ESCALATION_DELAY_SECS);
        assert_eq!(m.get(id).unwrap().escalation_level, 2);

        let channels: Vec<_> = m
            .deliveries()
            .into_iter()
            .map(|d| d.channel)
            .collect();
        assert_eq!(channels, vec!["log", "pager", "phone"]);
    }

    #[test]
    fn acknowledged_alerts_do_not_escalate() {
        let m = manager();
        let id = m
            .raise("chain", "btc", AlertSeverity::Error, "down", "", 0)
            .unwrap();
        m.acknowledge(id, "operator").unwrap();
        m.tick(DEFAULT_ESCALATION_DELAY_SECS + 1);
        assert_eq!(m.get(id).unwrap().escalation_level, 0);
    }

    #[test]
    fn maintenance_suppresses_and_marks_actives() {
        let m = manager();
        let id = m
            .raise("chain", "btc", AlertSeverity::Error, "down", "", 0)
            .unwrap();
        m.set_maintenance_mode(true, "planned upgrade");
        assert_eq!(m.get(id).unwrap().status, AlertStatus::Suppressed);
        assert!(m
            .raise("chain", "ltc", AlertSeverity::Error, "down", "", 10)
            .is_none());
        // Emergencies still fire during maintenance.
        assert!(m
            .raise("chain", "ltc", AlertSeverity::Emergency, "fire", "", 11)
            .is_some());
    }

    #[test]
    fn rule_suppression_window() {
        let m = manager();
        m.suppress_rule("chain", 500, "noisy", 0);
        assert!(m
            .raise("chain", "btc", AlertSeverity::Error, "down", "", 100)
            .is_none());
        assert!(m
            .raise("chain", "btc", AlertSeverity::Error, "down", "", 600)
            .is_some());
    }

    #[test]
    fn test_channel_reflects_rules() {
        let m = manager();
        assert!(m.test_channel("log"));
        assert!(!m.test_channel("sms"));
    }
}
