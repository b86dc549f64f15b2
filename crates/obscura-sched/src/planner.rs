use obscura_core::config::MixingConfig;
use obscura_core::constants::BPS_DENOM;
use obscura_core::error::MixError;
use obscura_core::plan::{ChangeOutput, Hop, HopStatus, ReleasePlan};
use obscura_core::pool::PooledAmount;
use obscura_core::session::Session;
use obscura_core::types::{Amount, Timestamp};
use obscura_crypto::rng;
use obscura_pool::Selection;

/// Delay-envelope parameters, lifted from the mixing config.
#[derive(Clone, Copy, Debug)]
pub struct PlanParams {
    pub min_delay_s: i64,
    pub max_delay_s: i64,
    pub mean_hop_delay_s: i64,
    pub hop_delay_cap_s: i64,
    pub jitter_max_s: i64,
}

impl From<&MixingConfig> for PlanParams {
    fn from(m: &MixingConfig) -> Self {
        Self {
            min_delay_s: m.min_delay_s,
            max_delay_s: m.max_delay_s,
            mean_hop_delay_s: m.mean_hop_delay_s,
            hop_delay_cap_s: m.hop_delay_cap_s,
            jitter_max_s: m.jitter_max_s,
        }
    }
}

/// How many times fire-time draws are resampled before the monotone clamp
/// takes over. Violations only arise from user delay hints, so this is
/// nearly always one pass.
const MAX_RESAMPLES: u32 = 4;

fn draw_fire_times(session: &Session, params: &PlanParams, t0: Timestamp) -> Vec<Timestamp> {
    let base = rng::draw_uniform(params.min_delay_s, params.max_delay_s);
    let mut cumulative = t0 + base;
    let mut times = Vec::with_capacity(session.outputs.len());
    for (i, output) in session.outputs.iter().enumerate() {
        if i > 0 {
            cumulative += rng::draw_trunc_exp(params.mean_hop_delay_s, params.hop_delay_cap_s);
        }
        let jitter = rng::draw_uniform(0, params.jitter_max_s);
        let hint = output.delay_hint.unwrap_or(0).max(0);
        times.push(cumulative + jitter + hint);
    }
    times
}

/// Build the release plan for a session from its reserved selection.
///
/// Hop amounts: floor(value × share / 10000), with the final hop absorbing
/// the rounding remainder so the plan conserves exactly. Fire times:
/// t₀ + U[min,max] base delay, truncated-exponential inter-hop gaps, and
/// uniform jitter per hop — all from the CSPRNG — monotone non-decreasing
/// across the plan.
pub fn build_plan(
    session: &Session,
    selection: &Selection,
    change_entry: Option<&PooledAmount>,
    params: &PlanParams,
    now: Timestamp,
) -> Result<ReleasePlan, MixError> {
    let value = selection.total();
    let shares: Vec<Amount> = session
        .outputs
        .iter()
        .map(|o| value * o.share_bps as Amount / BPS_DENOM as Amount)
        .collect();
    let assigned: Amount = shares.iter().sum();
    let remainder = value - assigned;

    let mut fire_times = draw_fire_times(session, params, now);
    let mut resamples = 0;
    while fire_times.windows(2).any(|w| w[1] < w[0]) && resamples < MAX_RESAMPLES {
        fire_times = draw_fire_times(session, params, now);
        resamples += 1;
    }
    // Delay hints can make monotonicity unsatisfiable; clamp as a last
    // resort so the invariant holds regardless.
    for i in 1..fire_times.len() {
        if fire_times[i] < fire_times[i - 1] {
            fire_times[i] = fire_times[i - 1];
        }
    }

    let hops: Vec<Hop> = session
        .outputs
        .iter()
        .enumerate()
        .map(|(i, output)| {
            let mut amount = shares[i];
            if i == session.outputs.len() - 1 {
                amount += remainder;
            }
            Hop {
                hop_index: i as u32,
                to_address: output.address.clone(),
                amount,
                fire_at: fire_times[i],
                nonce: rng::hop_nonce(),
                status: HopStatus::Pending,
            }
        })
        .collect();

    let change = change_entry.map(|entry| ChangeOutput {
        address: session.refund_address.clone(),
        amount: entry.amount,
        nonce: rng::hop_nonce(),
        status: HopStatus::Pending,
    });

    let plan = ReleasePlan {
        session_id: session.session_id,
        currency: session.currency,
        hops,
        reserved_entries: selection.entry_ids(),
        change,
        created_at: now,
    };

    let expected = value + change_entry.map(|e| e.amount).unwrap_or(0);
    plan.validate(expected)?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::pool::{DenominationClass, PoolEntryState};
    use obscura_core::session::{OutputSpec, SessionState};
    use obscura_core::types::{Address, Currency, PoolEntryId, SessionId};

    fn params() -> PlanParams {
        PlanParams {
            min_delay_s: 600,
            max_delay_s: 7_200,
            mean_hop_delay_s: 900,
            hop_delay_cap_s: 3_600,
            jitter_max_s: 120,
        }
    }

    fn session(outputs: Vec<OutputSpec>) -> Session {
        Session {
            session_id: SessionId::from_bytes([1; 16]),
            currency: Currency::Btc,
            deposit_address: Address("dep".into()),
            expected_amount: 100_000_000,
            outputs,
            fee_bps: 100,
            refund_address: Address("refund".into()),
            created_at: 0,
            expires_at: 86_400,
            state: SessionState::Created,
            deposit_txid: None,
            deposit_confirmations: 0,
            attempts: 0,
            audit_len: 0,
        }
    }

    fn selection(amounts: &[Amount]) -> Selection {
        Selection {
            entries: amounts
                .iter()
                .enumerate()
                .map(|(i, &amount)| PooledAmount {
                    pool_entry_id: PoolEntryId::from_bytes([i as u8; 16]),
                    currency: Currency::Btc,
                    amount,
                    origin_session_id: SessionId::from_bytes([100 + i as u8; 16]),
                    available_at: 0,
                    denomination_class: DenominationClass(0),
                    fractional: false,
                    state: PoolEntryState::Available,
                })
                .collect(),
            distinct_origins: amounts.len(),
        }
    }

    fn output(addr: &str, bps: u16) -> OutputSpec {
        OutputSpec {
            address: Address(addr.into()),
            share_bps: bps,
            delay_hint: None,
        }
    }

    #[test]
    fn split_shares_conserve_with_remainder_to_last() {
        // 0.99 BTC mixed over a 70/30 split.
        let s = session(vec![output("x", 7_000), output("y", 3_000)]);
        let sel = selection(&[90_000_000, 9_000_000]);
        let plan = build_plan(&s, &sel, None, &params(), 1_000).unwrap();
        assert_eq!(plan.hops[0].amount, 69_300_000);
        assert_eq!(plan.hops[1].amount, 29_700_000);
        assert_eq!(plan.planned_value(), 99_000_000);
    }

    #[test]
    fn rounding_remainder_goes_to_final_hop() {
        let s = session(vec![output("a", 3_333), output("b", 3_333), output("c", 3_334)]);
        let sel = selection(&[1_000_000]);
        let plan = build_plan(&s, &sel, None, &params(), 1_000).unwrap();
        let total: Amount = plan.hops.iter().map(|h| h.amount).sum();
        assert_eq!(total, 1_000_000);
        // floor splits underfill; the last hop absorbs every lost unit.
        assert!(plan.hops[2].amount >= plan.hops[0].amount);
    }

    #[test]
    fn fire_times_monotone_and_in_envelope() {
        let p = params();
        let s = session(vec![output("a", 2_500); 4]);
        let sel = selection(&[1_000_000]);
        for _ in 0..20 {
            let plan = build_plan(&s, &sel, None, &p, 10_000).unwrap();
            for pair in plan.hops.windows(2) {
                assert!(pair[1].fire_at >= pair[0].fire_at);
            }
            let first = plan.hops[0].fire_at - 10_000;
            assert!(first >= p.min_delay_s);
            assert!(first <= p.max_delay_s + p.jitter_max_s);
        }
    }

    #[test]
    fn delay_hints_cannot_break_monotonicity() {
        let mut o1 = output("a", 5_000);
        o1.delay_hint = Some(50_000);
        let o2 = output("b", 5_000);
        let s = session(vec![o1, o2]);
        let sel = selection(&[1_000_000]);
        let plan = build_plan(&s, &sel, None, &params(), 0).unwrap();
        assert!(plan.hops[1].fire_at >= plan.hops[0].fire_at);
    }

    #[test]
    fn change_output_carries_the_residual() {
        let s = session(vec![output("x", 10_000)]);
        let sel = selection(&[1_000_000]);
        let residual = PooledAmount {
            pool_entry_id: PoolEntryId::from_bytes([9; 16]),
            currency: Currency::Btc,
            amount: 42_000,
            origin_session_id: s.session_id,
            available_at: 0,
            denomination_class: DenominationClass(0),
            fractional: true,
            state: PoolEntryState::Available,
        };
        let plan = build_plan(&s, &sel, Some(&residual), &params(), 0).unwrap();
        let change = plan.change.as_ref().unwrap();
        assert_eq!(change.amount, 42_000);
        assert_eq!(change.address, s.refund_address);
        assert_eq!(plan.planned_value(), 1_042_000);
    }

    #[test]
    fn hop_nonces_are_distinct() {
        let s = session(vec![output("a", 5_000), output("b", 5_000)]);
        let sel = selection(&[1_000_000]);
        let plan = build_plan(&s, &sel, None, &params(), 0).unwrap();
        assert_ne!(plan.hops[0].nonce.0, plan.hops[1].nonce.0);
    }
}
