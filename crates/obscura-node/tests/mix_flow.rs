//! End-to-end mixing scenarios against a scripted in-process chain.
//!
//! Each test assembles the full core (store, governor, audit, alerts,
//! facade, pool, scheduler, session machine) over a mock adapter, scripts
//! deposits and confirmations, and asserts the user-visible outcome plus
//! the conservation and anonymity invariants.
//!
//! Run with:
//!   cargo test -p obscura-node --test mix_flow

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use obscura_audit::{AuditLog, AuditStore};
use obscura_chain::mock::MockAdapter;
use obscura_chain::{ChainFacade, FeeEstimator};
use obscura_core::config::{Config, FeePolicy};
use obscura_core::session::OutputSpec;
use obscura_core::types::{Address, Amount, Currency, StreamId};
use obscura_govern::ResourceGovernor;
use obscura_health::AlertManager;
use obscura_pool::LiquidityPool;
use obscura_sched::{SchedEvent, Scheduler};
use obscura_session::{CancelOutcome, CreateRequest, SessionManager, SessionView};
use obscura_store::MixStore;

const COIN: Amount = 100_000_000;

struct Harness {
    dir: PathBuf,
    store: Arc<MixStore>,
    audit: Arc<AuditLog>,
    mock: Arc<MockAdapter>,
    pool: Arc<LiquidityPool>,
    sessions: Arc<SessionManager>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn test_config(k_min: usize) -> Config {
    let mut config = Config::default();
    config.currencies.retain(|c, _| *c == Currency::Btc);
    config.mixing.k_min = k_min;
    // Tight delay envelope so hops fire within test budgets.
    config.mixing.min_delay_s = 0;
    config.mixing.max_delay_s = 1;
    config.mixing.mean_hop_delay_s = 0;
    config.mixing.hop_delay_cap_s = 1;
    config.mixing.jitter_max_s = 0;
    config
}

fn harness(tag: &str, k_min: usize, confirmations_required: u32) -> Harness {
    let dir = std::env::temp_dir().join(format!("obscura_mix_flow_{tag}"));
    let _ = std::fs::remove_dir_all(&dir);
    let config = test_config(k_min);

    let store = Arc::new(MixStore::open(&dir).unwrap());
    let governor = ResourceGovernor::new(config.resource.clone());
    let audit = Arc::new(AuditLog::new(Arc::clone(&store) as Arc<dyn AuditStore>));
    let alerts = Arc::new(AlertManager::with_default_rules(vec!["log".into()], 300, 100));

    let mock = Arc::new(MockAdapter::new(Currency::Btc));
    let mut facade = ChainFacade::new(Arc::clone(&store), &governor);
    facade.register_adapter(
        mock.clone(),
        confirmations_required,
        FeeEstimator::new(FeePolicy::default()),
    );
    let facade = Arc::new(facade);

    let pool = Arc::new(LiquidityPool::new(&config, Arc::clone(&store)).unwrap());
    let (sched_event_tx, sched_event_rx) = tokio::sync::mpsc::channel::<SchedEvent>(256);
    let (scheduler, sched_tx) = Scheduler::new(
        Arc::clone(&facade),
        Arc::clone(&pool),
        Arc::clone(&store),
        config.mixing.clone(),
        sched_event_tx,
    );
    tokio::spawn(scheduler.run());

    let sessions = SessionManager::start(
        Arc::clone(&store),
        Arc::clone(&audit),
        Arc::clone(&pool),
        facade,
        sched_tx,
        sched_event_rx,
        alerts,
        governor,
        config,
    );

    Harness {
        dir,
        store,
        audit,
        mock,
        pool,
        sessions,
    }
}

fn request(amount: Amount, fee_bps: u16, outputs: &[(&str, u16)]) -> CreateRequest {
    CreateRequest {
        currency: Currency::Btc,
        amount,
        outputs: outputs
            .iter()
            .map(|(addr, bps)| OutputSpec {
                address: Address(addr.to_string()),
                share_bps: *bps,
                delay_hint: None,
            })
            .collect(),
        fee_bps: Some(fee_bps),
        refund_address: Address("refund-addr".into()),
    }
}

async fn wait_for<F>(what: &str, secs: u64, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("timed out waiting for {what}");
}

fn status_of(h: &Harness, view: &SessionView) -> String {
    h.sessions
        .observe(&view.session_id)
        .unwrap()
        .unwrap()
        .status
}

/// Create a funder session and drive its deposit to the pool so the
/// target session has non-self inventory to draw from.
async fn fund_pool(h: &Harness, tag: &str, amount: Amount, fee_bps: u16) {
    let funder_out = format!("funder-out-{tag}");
    let funder = h
        .sessions
        .create(request(amount, fee_bps, &[(funder_out.as_str(), 10_000)]))
        .await
        .unwrap();
    h.mock.fund(&funder.deposit_address, amount, 1);
    let sessions = Arc::clone(&h.sessions);
    let id = funder.session_id;
    wait_for("funder pooled", 60, || {
        sessions
            .store()
            .get_session(&id)
            .unwrap()
            .map(|s| s.state.name() == "pooled" || s.state.name() == "scheduled")
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_single_output_conserves_value() {
    let h = harness("happy", 1, 1);
    fund_pool(&h, "a", COIN, 50).await;

    let view = h
        .sessions
        .create(request(COIN, 50, &[("alice-out", 10_000)]))
        .await
        .unwrap();
    h.mock.fund(&view.deposit_address, COIN, 1);

    // The hop to alice fires once the session is pooled and promoted.
    let mock = Arc::clone(&h.mock);
    wait_for("payout submitted", 90, || {
        mock.sent().iter().any(|s| s.to.as_str() == "alice-out")
    })
    .await;

    let sent = h
        .mock
        .sent()
        .into_iter()
        .find(|s| s.to.as_str() == "alice-out")
        .unwrap();
    // Conservation: payout + operator fee = deposit, exactly.
    let fee = COIN * 50 / 10_000;
    assert_eq!(sent.amount + fee, COIN);

    h.mock.set_confirmations(&sent.txid, 1);
    let sessions = Arc::clone(&h.sessions);
    let id = view.session_id;
    wait_for("session released", 90, || {
        sessions
            .observe(&id)
            .unwrap()
            .map(|v| v.status == "released")
            .unwrap_or(false)
    })
    .await;

    // Terminal state wipes the deposit key and the audit chain verifies.
    assert!(!h.store.vault().contains(&id));
    let events = h.audit.verify_stream(&StreamId::Session(id)).unwrap();
    assert!(events >= 5, "expected a full transition trail, got {events}");
}

#[tokio::test(flavor = "multi_thread")]
async fn split_outputs_round_to_last_hop_in_order() {
    let h = harness("split", 1, 1);
    fund_pool(&h, "a", COIN, 100).await;

    let view = h
        .sessions
        .create(request(COIN, 100, &[("x-out", 7_000), ("y-out", 3_000)]))
        .await
        .unwrap();
    h.mock.fund(&view.deposit_address, COIN, 1);

    let mock = Arc::clone(&h.mock);
    wait_for("both hops submitted", 90, || {
        let sent = mock.sent();
        sent.iter().any(|s| s.to.as_str() == "x-out")
            && sent.iter().any(|s| s.to.as_str() == "y-out")
    })
    .await;

    let sent = h.mock.sent();
    let x_pos = sent.iter().position(|s| s.to.as_str() == "x-out").unwrap();
    let y_pos = sent.iter().position(|s| s.to.as_str() == "y-out").unwrap();
    // 1.000 at 100 bps fee → 0.6930 / 0.2970, fired in index order.
    assert_eq!(sent[x_pos].amount, 69_300_000);
    assert_eq!(sent[y_pos].amount, 29_700_000);
    assert!(x_pos < y_pos, "hops must fire in index order");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_before_deposit_destroys_key() {
    let h = harness("cancel", 1, 1);
    let view = h
        .sessions
        .create(request(COIN, 50, &[("out", 10_000)]))
        .await
        .unwrap();
    assert!(h.store.vault().contains(&view.session_id));

    let outcome = h.sessions.cancel(&view.session_id).await;
    assert_eq!(outcome, CancelOutcome::Ok);
    assert_eq!(status_of(&h, &view), "failed");
    assert!(!h.store.vault().contains(&view.session_id));
    // Nothing ever reached the pool.
    assert_eq!(h.pool.available_value(Currency::Btc, i64::MAX).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn anonymity_floor_blocks_until_enough_origins() {
    let h = harness("kmin", 3, 1);
    fund_pool(&h, "a", COIN, 50).await;
    fund_pool(&h, "b", COIN, 50).await;

    let view = h
        .sessions
        .create(request(COIN, 50, &[("target-out", 10_000)]))
        .await
        .unwrap();
    h.mock.fund(&view.deposit_address, COIN, 1);

    // With only two distinct non-self origins, promotion must hold.
    let sessions = Arc::clone(&h.sessions);
    let id = view.session_id;
    wait_for("target pooled", 60, || {
        sessions
            .store()
            .get_session(&id)
            .unwrap()
            .map(|s| s.state.name() == "pooled")
            .unwrap_or(false)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let state = h.store.get_session(&id).unwrap().unwrap().state;
    assert_eq!(state.name(), "pooled", "k_min=3 with 2 origins must wait");

    // A third origin arrives; the session promotes and pays out.
    fund_pool(&h, "c", COIN, 50).await;
    let mock = Arc::clone(&h.mock);
    wait_for("payout after third origin", 120, || {
        mock.sent().iter().any(|s| s.to.as_str() == "target-out")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn amount_mismatch_refunds_to_refund_address() {
    let h = harness("mismatch", 1, 1);
    let view = h
        .sessions
        .create(request(COIN, 50, &[("out", 10_000)]))
        .await
        .unwrap();
    // User sends 1.1 BTC against an expected 1.0.
    h.mock.fund(&view.deposit_address, COIN + 10_000_000, 1);

    let sessions = Arc::clone(&h.sessions);
    let id = view.session_id;
    wait_for("session refunded", 90, || {
        sessions
            .observe(&id)
            .unwrap()
            .map(|v| v.status == "refunded")
            .unwrap_or(false)
    })
    .await;

    let refund = h
        .mock
        .sent()
        .into_iter()
        .find(|s| s.to.as_str() == "refund-addr")
        .expect("refund broadcast");
    // Observed amount minus the network fee (mock rate 10 × 200 vbytes).
    assert_eq!(refund.amount, COIN + 10_000_000 - 2_000);
    assert!(!h.store.vault().contains(&id));
}

#[tokio::test(flavor = "multi_thread")]
async fn underpaid_dust_deposit_refunds_without_pool_mutation() {
    let h = harness("dust", 1, 1);
    let view = h
        .sessions
        .create(request(COIN, 50, &[("out", 10_000)]))
        .await
        .unwrap();
    // 0.0005 BTC against an expected 1.0: a mismatch that is also below
    // the smallest rung. The funds still belong to the user, so the key
    // must survive until the refund is out.
    h.mock.fund(&view.deposit_address, 50_000, 1);

    let sessions = Arc::clone(&h.sessions);
    let id = view.session_id;
    wait_for("session refunded", 90, || {
        sessions
            .observe(&id)
            .unwrap()
            .map(|v| v.status == "refunded")
            .unwrap_or(false)
    })
    .await;

    let refund = h
        .mock
        .sent()
        .into_iter()
        .find(|s| s.to.as_str() == "refund-addr")
        .expect("refund broadcast");
    // Observed amount minus the network fee (mock rate 10 × 200 vbytes).
    assert_eq!(refund.amount, 50_000 - 2_000);
    // No pool mutation, and the key is gone only after the refund.
    assert_eq!(h.pool.available_value(Currency::Btc, i64::MAX).unwrap(), 0);
    assert!(!h.store.vault().contains(&id));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_releasing_settles_terminally() {
    let h = harness("cancel_release", 1, 1);
    fund_pool(&h, "a", COIN, 50).await;

    // The second leg is hinted an hour out so the cancel lands between
    // the first submission and the second fire time.
    let view = h
        .sessions
        .create(CreateRequest {
            currency: Currency::Btc,
            amount: COIN,
            outputs: vec![
                OutputSpec {
                    address: Address("early-out".into()),
                    share_bps: 5_000,
                    delay_hint: None,
                },
                OutputSpec {
                    address: Address("late-out".into()),
                    share_bps: 5_000,
                    delay_hint: Some(3_600),
                },
            ],
            fee_bps: Some(50),
            refund_address: Address("refund-addr".into()),
        })
        .await
        .unwrap();
    h.mock.fund(&view.deposit_address, COIN, 1);

    let mock = Arc::clone(&h.mock);
    wait_for("first hop submitted", 90, || {
        mock.sent().iter().any(|s| s.to.as_str() == "early-out")
    })
    .await;

    // Submitted hops run to confirmation; only the unissued one cancels.
    let outcome = h.sessions.cancel(&view.session_id).await;
    assert_eq!(outcome, CancelOutcome::TooLate);

    let early = h
        .mock
        .sent()
        .into_iter()
        .find(|s| s.to.as_str() == "early-out")
        .unwrap();
    h.mock.set_confirmations(&early.txid, 1);

    // Once the in-flight hop confirms and the late hop is cancelled the
    // session must settle terminally, not sit in releasing forever.
    let sessions = Arc::clone(&h.sessions);
    let id = view.session_id;
    wait_for("terminal state after cancel", 120, || {
        sessions
            .store()
            .get_session(&id)
            .unwrap()
            .map(|s| s.state.is_terminal())
            .unwrap_or(false)
    })
    .await;

    // The cancelled leg never reached the chain, and the key is gone.
    assert!(h.mock.sent().iter().all(|s| s.to.as_str() != "late-out"));
    assert_eq!(status_of(&h, &view), "failed");
    assert!(!h.store.vault().contains(&id));
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_failure_pauses_then_resumes_submissions() {
    let h = harness("pause", 1, 1);
    fund_pool(&h, "a", COIN, 50).await;

    // Take the endpoint down before the target's plan can fire.
    h.mock.set_unavailable(true);
    let view = h
        .sessions
        .create(request(COIN, 50, &[("paused-out", 10_000)]))
        .await
        .unwrap();
    h.mock.fund(&view.deposit_address, COIN, 1);

    // Deposit polling also fails while down, so nothing should be sent.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(h
        .mock
        .sent()
        .iter()
        .all(|s| s.to.as_str() != "paused-out"));

    // Recovery: watching resumes, the hop fires, value is conserved.
    h.mock.set_unavailable(false);
    let mock = Arc::clone(&h.mock);
    wait_for("payout after recovery", 120, || {
        mock.sent().iter().any(|s| s.to.as_str() == "paused-out")
    })
    .await;
    let sent = h
        .mock
        .sent()
        .into_iter()
        .find(|s| s.to.as_str() == "paused-out")
        .unwrap();
    assert_eq!(sent.amount + COIN * 50 / 10_000, COIN);
}
