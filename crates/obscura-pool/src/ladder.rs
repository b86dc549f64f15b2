use obscura_core::error::MixError;
use obscura_core::pool::DenominationClass;
use obscura_core::types::Amount;

/// One currency's standardized value ladder, ascending. Deposits are split
/// greedily from the largest rung downward; whatever is left below the
/// smallest rung is the fractional residual.
#[derive(Clone, Debug)]
pub struct DenominationLadder {
    rungs: Vec<Amount>,
}

impl DenominationLadder {
    pub fn new(rungs: Vec<Amount>) -> Result<Self, MixError> {
        if rungs.is_empty() {
            return Err(MixError::Config("empty denomination ladder".into()));
        }
        if rungs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MixError::Config(
                "denominations must be strictly ascending".into(),
            ));
        }
        Ok(Self { rungs })
    }

    pub fn smallest(&self) -> Amount {
        self.rungs[0]
    }

    pub fn rung(&self, class: DenominationClass) -> Option<Amount> {
        self.rungs.get(class.0 as usize).copied()
    }

    pub fn classes(&self) -> impl Iterator<Item = (DenominationClass, Amount)> + '_ {
        self.rungs
            .iter()
            .enumerate()
            .map(|(i, &d)| (DenominationClass(i as u8), d))
    }

    /// Greedy split of `value` from the largest rung downward. Returns the
    /// per-class counts and the residual below the smallest rung. The
    /// multiset sums exactly: Σ(count × rung) + residual = value.
    pub fn split(&self, value: Amount) -> (Vec<(DenominationClass, u64)>, Amount) {
        let mut remaining = value;
        let mut counts = Vec::new();
        for (i, &rung) in self.rungs.iter().enumerate().rev() {
            let count = remaining / rung;
            if count > 0 {
                counts.push((DenominationClass(i as u8), count as u64));
                remaining -= count * rung;
            }
        }
        counts.reverse();
        (counts, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> DenominationLadder {
        DenominationLadder::new(vec![100_000, 1_000_000, 10_000_000, 100_000_000]).unwrap()
    }

    #[test]
    fn split_sums_exactly() {
        let l = ladder();
        for value in [0u128, 99_999, 100_000, 123_456_789, 999_999_999] {
            let (counts, residual) = l.split(value);
            let total: Amount = counts
                .iter()
                .map(|(c, n)| l.rung(*c).unwrap() * *n as Amount)
                .sum();
            assert_eq!(total + residual, value, "split of {value} must conserve");
        }
    }

    #[test]
    fn split_prefers_large_rungs() {
        let l = ladder();
        let (counts, residual) = l.split(210_000_000);
        assert_eq!(
            counts,
            vec![(DenominationClass(3), 2), (DenominationClass(2), 1)]
        );
        assert_eq!(residual, 0);
    }

    #[test]
    fn below_smallest_is_all_residual() {
        let l = ladder();
        let (counts, residual) = l.split(99_999);
        assert!(counts.is_empty());
        assert_eq!(residual, 99_999);
    }

    #[test]
    fn rejects_unsorted_rungs() {
        assert!(DenominationLadder::new(vec![10, 10]).is_err());
        assert!(DenominationLadder::new(vec![]).is_err());
    }
}
