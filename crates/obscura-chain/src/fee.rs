use obscura_core::config::FeePolicy;

/// Fee table lookups and retry bumping for one currency.
///
/// The table maps confirmation targets to rates; bumping raises the rate
/// by the policy percentage per attempt and is clamped by the absolute
/// cap, so a retry loop can never run away.
#[derive(Clone, Debug)]
pub struct FeeEstimator {
    policy: FeePolicy,
}

impl FeeEstimator {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Rate for a confirmation target: the entry with the largest target
    /// that is ≤ the requested one, else the default rate.
    pub fn rate_for_target(&self, conf_target: u32) -> u64 {
        self.policy
            .targets
            .iter()
            .filter(|(target, _)| *target <= conf_target)
            .max_by_key(|(target, _)| *target)
            .map(|(_, rate)| *rate)
            .unwrap_or(self.policy.default_rate)
    }

    /// Rate after `bumps` retries, capped at the policy ceiling.
    pub fn bumped_rate(&self, base_rate: u64, bumps: u32) -> u64 {
        let mut rate = base_rate;
        for _ in 0..bumps {
            rate += rate * self.policy.bump_percent / 100;
        }
        rate.min(self.policy.fee_cap_rate)
    }

    pub fn cap(&self) -> u64 {
        self.policy.fee_cap_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> FeeEstimator {
        FeeEstimator::new(FeePolicy {
            targets: vec![(1, 40), (3, 20), (6, 10)],
            default_rate: 20,
            bump_percent: 25,
            fee_cap_rate: 60,
        })
    }

    #[test]
    fn table_lookup_picks_nearest_lower_target() {
        let e = estimator();
        assert_eq!(e.rate_for_target(1), 40);
        assert_eq!(e.rate_for_target(2), 40);
        assert_eq!(e.rate_for_target(3), 20);
        assert_eq!(e.rate_for_target(10), 10);
        // Below every entry: fall back to the default.
        assert_eq!(e.rate_for_target(0), 20);
    }

    #[test]
    fn bumps_compound_and_cap() {
        let e = estimator();
        assert_eq!(e.bumped_rate(40, 0), 40);
        assert_eq!(e.bumped_rate(40, 1), 50);
        // 50 + 12 = 62 → capped at 60.
        assert_eq!(e.bumped_rate(40, 2), 60);
        assert_eq!(e.bumped_rate(40, 10), 60);
    }
}
