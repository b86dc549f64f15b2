//! Runtime configuration.
//!
//! One JSON file loaded at startup. Everything here has a sane default so a
//! development node can run from an empty file; `validate()` is what gates a
//! production `serve`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::MixError;
use crate::types::{Amount, Currency};

// ── FeePolicy ────────────────────────────────────────────────────────────────

/// Per-currency network-fee policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeePolicy {
    /// confirmation_target (blocks/slots) → fee rate in the chain's native
    /// rate unit (sat/vB, gwei, …). Sorted ascending by target.
    pub targets: Vec<(u32, u64)>,
    /// Fallback rate when the table has no entry.
    pub default_rate: u64,
    /// Each retry bump raises the rate by this percentage.
    pub bump_percent: u64,
    /// Absolute rate ceiling; bumping never exceeds this.
    pub fee_cap_rate: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            targets: vec![(1, 40), (3, 20), (6, 10)],
            default_rate: 20,
            bump_percent: FEE_BUMP_PERCENT,
            fee_cap_rate: 400,
        }
    }
}

// ── CurrencyConfig ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// JSON-RPC endpoint for this currency's node.
    pub endpoint: String,
    /// Optional RPC credentials (`user:pass` for basic auth).
    pub credentials: Option<String>,
    pub confirmations_required: u32,
    pub fee_policy: FeePolicy,
    pub min_amount: Amount,
    pub max_amount: Amount,
    /// Denomination ladder in minor units, ascending. A deposit is split
    /// greedily from the largest rung downward.
    pub denominations: Vec<Amount>,
}

impl CurrencyConfig {
    pub fn defaults_for(currency: Currency) -> Self {
        // Powers-of-ten ladders in each chain's minor units.
        let denominations: Vec<Amount> = match currency {
            Currency::Btc | Currency::Ltc => {
                vec![100_000, 1_000_000, 10_000_000, 100_000_000, 1_000_000_000]
            }
            Currency::Eth => vec![
                10_000_000_000_000_000,
                100_000_000_000_000_000,
                1_000_000_000_000_000_000,
                10_000_000_000_000_000_000,
            ],
            Currency::Zec => {
                vec![100_000, 1_000_000, 10_000_000, 100_000_000, 1_000_000_000]
            }
            Currency::Sol => vec![
                10_000_000,
                100_000_000,
                1_000_000_000,
                10_000_000_000,
            ],
        };
        let min_amount = denominations[0];
        let max_amount = *denominations.last().unwrap_or(&min_amount) * 100;
        Self {
            endpoint: format!("http://127.0.0.1:18000/{}", currency.code()),
            credentials: None,
            confirmations_required: currency.default_confirmations(),
            fee_policy: FeePolicy::default(),
            min_amount,
            max_amount,
            denominations,
        }
    }
}

// ── MixingConfig ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixingConfig {
    pub k_min: usize,
    pub min_delay_s: i64,
    pub max_delay_s: i64,
    pub mean_hop_delay_s: i64,
    pub hop_delay_cap_s: i64,
    pub jitter_max_s: i64,
    pub retry_budget: u32,
    pub max_fee_bumps: u32,
    pub lease_ttl_s: i64,
    pub session_ttl_s: i64,
    pub fee_bps_default: u16,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            k_min: DEFAULT_K_MIN,
            min_delay_s: DEFAULT_MIN_DELAY_SECS,
            max_delay_s: DEFAULT_MAX_DELAY_SECS,
            mean_hop_delay_s: DEFAULT_MEAN_HOP_DELAY_SECS,
            hop_delay_cap_s: DEFAULT_HOP_DELAY_CAP_SECS,
            jitter_max_s: DEFAULT_JITTER_MAX_SECS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_fee_bumps: DEFAULT_MAX_FEE_BUMPS,
            lease_ttl_s: DEFAULT_LEASE_TTL_SECS,
            session_ttl_s: DEFAULT_SESSION_TTL_SECS,
            fee_bps_default: DEFAULT_FEE_BPS,
        }
    }
}

// ── ResourceConfig ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Fraction of `memory_budget_bytes` that triggers warning + cleanup.
    pub heap_warning: f64,
    /// Fraction that triggers emergency cleanup.
    pub heap_critical: f64,
    pub monitor_interval_s: u64,
    /// Process memory budget the thresholds are measured against.
    pub memory_budget_bytes: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            heap_warning: DEFAULT_HEAP_WARNING,
            heap_critical: DEFAULT_HEAP_CRITICAL,
            monitor_interval_s: DEFAULT_MONITOR_INTERVAL_SECS,
            memory_budget_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

// ── AlertsConfig ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Notification channels, in escalation order (level 0 first).
    pub channels: Vec<String>,
    pub escalation_timeouts_s: Vec<i64>,
    pub max_per_hour: u32,
    pub cooldown_minutes: i64,
    pub maintenance_mode: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            channels: vec!["log".into()],
            escalation_timeouts_s: vec![DEFAULT_ESCALATION_DELAY_SECS],
            max_per_hour: DEFAULT_ALERTS_MAX_PER_HOUR,
            cooldown_minutes: DEFAULT_ALERT_COOLDOWN_SECS / 60,
            maintenance_mode: false,
        }
    }
}

// ── TransportConfig ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    pub primary: String,
    pub fallback: Option<String>,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            primary: "clearnet".into(),
            fallback: None,
            timeout_ms: 15_000,
            retries: 2,
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON-RPC API bind address.
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub currencies: BTreeMap<Currency, CurrencyConfig>,
    pub mixing: MixingConfig,
    pub resource: ResourceConfig,
    pub alerts: AlertsConfig,
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut currencies = BTreeMap::new();
        for c in Currency::ALL {
            currencies.insert(c, CurrencyConfig::defaults_for(c));
        }
        Self {
            listen_addr: "127.0.0.1:8545".into(),
            data_dir: PathBuf::from("~/.obscura/data"),
            currencies,
            mixing: MixingConfig::default(),
            resource: ResourceConfig::default(),
            alerts: AlertsConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, MixError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| MixError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&json)
            .map_err(|e| MixError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn currency(&self, c: Currency) -> Result<&CurrencyConfig, MixError> {
        self.currencies
            .get(&c)
            .ok_or(MixError::MissingCurrencyConfig(c))
    }

    pub fn enabled_currencies(&self) -> Vec<Currency> {
        self.currencies.keys().copied().collect()
    }

    pub fn validate(&self) -> Result<(), MixError> {
        if self.currencies.is_empty() {
            return Err(MixError::Config("no currencies enabled".into()));
        }
        for (c, cc) in &self.currencies {
            if cc.denominations.is_empty() {
                return Err(MixError::Config(format!("{c}: empty denomination ladder")));
            }
            if cc.denominations.windows(2).any(|w| w[0] >= w[1]) {
                return Err(MixError::Config(format!(
                    "{c}: denominations must be strictly ascending"
                )));
            }
            if cc.min_amount < cc.denominations[0] {
                return Err(MixError::Config(format!(
                    "{c}: min_amount below smallest denomination"
                )));
            }
            if cc.confirmations_required == 0 {
                return Err(MixError::Config(format!(
                    "{c}: confirmations_required must be at least 1"
                )));
            }
        }
        if self.mixing.k_min == 0 {
            return Err(MixError::Config("mixing.k_min must be at least 1".into()));
        }
        if self.mixing.min_delay_s > self.mixing.max_delay_s {
            return Err(MixError::Config(
                "mixing.min_delay_s exceeds max_delay_s".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.resource.heap_warning)
            || !(0.0..=1.0).contains(&self.resource.heap_critical)
            || self.resource.heap_warning >= self.resource.heap_critical
        {
            return Err(MixError::Config(
                "resource thresholds must satisfy 0 < warning < critical <= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_unsorted_ladder() {
        let mut cfg = Config::default();
        cfg.currencies.get_mut(&Currency::Btc).unwrap().denominations =
            vec![1_000_000, 100_000];
        assert!(matches!(cfg.validate(), Err(MixError::Config(_))));
    }

    #[test]
    fn rejects_inverted_delay_window() {
        let mut cfg = Config::default();
        cfg.mixing.min_delay_s = 10_000;
        cfg.mixing.max_delay_s = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_currencies() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.currencies.len(), Currency::ALL.len());
        back.validate().unwrap();
    }
}
