use std::sync::Arc;

use obscura_audit::{AuditLog, EventKind};
use obscura_chain::{ChainEvent, ChainFacade, FundingSource, TxIntent};
use obscura_core::config::Config;
use obscura_core::constants::{REORG_WINDOW_MULTIPLIER, SESSION_QUEUE_DEPTH};
use obscura_core::error::{ErrorContext, MixError, Severity};
use obscura_core::retry::{execute_with_retry, exponential_backoff_ms, RetryStrategy};
use obscura_core::session::{
    validate_fee_bps, validate_outputs, FailureReason, OutputSpec, Session, SessionState,
};
use obscura_core::types::{
    Address, Amount, Bps, ChainFamily, ChainTxId, Currency, HopNonce, SessionId, StreamId,
    Timestamp,
};
use obscura_core::plan::HopStatus;
use obscura_crypto::hash::blake3_hash;
use obscura_crypto::rng;
use obscura_govern::{BoundedCollection, ResourceGovernor, TimerKind};
use obscura_health::{AlertManager, AlertSeverity};
use obscura_pool::LiquidityPool;
use obscura_sched::{build_plan, PlanParams, SchedCommand, SchedEvent};
use obscura_store::MixStore;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Active-worker index bound: far above any realistic concurrent session
/// count; eviction only respawns a worker from persisted state.
const WORKER_INDEX_CAP: usize = 16_384;

// ── Public API types ─────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub currency: Currency,
    pub amount: Amount,
    pub outputs: Vec<OutputSpec>,
    pub fee_bps: Option<Bps>,
    pub refund_address: Address,
}

#[derive(Clone, Debug)]
pub struct SessionView {
    pub session_id: SessionId,
    pub deposit_address: Address,
    /// Coarse user-visible status only; internal detail stays inside.
    pub status: String,
    pub deposit_confirmations: u32,
    pub hops: Vec<(u32, String)>,
    pub expires_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Ok,
    TooLate,
    NotFound,
}

// ── Edges ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum SessionEdge {
    DepositSeen { txid: ChainTxId, amount: Amount },
    DepositConfirmations { confirmations: u32 },
    DepositReorged,
    PlanAttempt,
    HopSubmitted { hop_index: u32, txid: ChainTxId },
    HopConfirmed { hop_index: u32 },
    HopFailed { hop_index: u32, reason: String },
    HopsCancelled,
    ChangeSubmitted { txid: ChainTxId },
    RefundAttempt { amount: Amount },
    Expire,
    Cancel { reply: oneshot::Sender<CancelOutcome> },
}

// ── SessionManager ───────────────────────────────────────────────────────────

/// Owns every session worker. One mpsc queue per session; a worker drains
/// it serially, so per-session edges are linearized end to end.
pub struct SessionManager {
    store: Arc<MixStore>,
    audit: Arc<AuditLog>,
    pool: Arc<LiquidityPool>,
    facade: Arc<ChainFacade>,
    sched: mpsc::Sender<SchedCommand>,
    alerts: Arc<AlertManager>,
    governor: Arc<ResourceGovernor>,
    config: Config,
    workers: Arc<Mutex<BoundedCollection<SessionId, mpsc::Sender<SessionEdge>>>>,
    chain_tx: mpsc::Sender<ChainEvent>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        store: Arc<MixStore>,
        audit: Arc<AuditLog>,
        pool: Arc<LiquidityPool>,
        facade: Arc<ChainFacade>,
        sched: mpsc::Sender<SchedCommand>,
        sched_events: mpsc::Receiver<SchedEvent>,
        alerts: Arc<AlertManager>,
        governor: Arc<ResourceGovernor>,
        config: Config,
    ) -> Arc<Self> {
        let (chain_tx, chain_rx) = mpsc::channel(1_024);
        let workers = Arc::new(Mutex::new(BoundedCollection::new(
            "session-workers",
            WORKER_INDEX_CAP,
            WORKER_INDEX_CAP / 2,
            None,
        )));
        governor.collections.register(workers.clone());

        let manager = Arc::new(Self {
            store,
            audit,
            pool,
            facade,
            sched,
            alerts,
            governor: Arc::clone(&governor),
            config,
            workers,
            chain_tx,
        });

        manager.spawn_pumps(chain_rx, sched_events, &governor);
        if let Err(e) = manager.resume() {
            warn!(error = %e, "session resume failed");
        }
        manager
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        mut chain_rx: mpsc::Receiver<ChainEvent>,
        mut sched_rx: mpsc::Receiver<SchedEvent>,
        governor: &ResourceGovernor,
    ) {
        let chain_manager = Arc::clone(self);
        let chain_pump = tokio::spawn(async move {
            while let Some(event) = chain_rx.recv().await {
                let (session, edge) = match event {
                    ChainEvent::DepositSeen {
                        session,
                        txid,
                        amount,
                    } => (session, SessionEdge::DepositSeen { txid, amount }),
                    ChainEvent::DepositConfirmations {
                        session,
                        confirmations,
                    } => (session, SessionEdge::DepositConfirmations { confirmations }),
                    ChainEvent::DepositReorged { session } => {
                        (session, SessionEdge::DepositReorged)
                    }
                };
                chain_manager.dispatch(session, edge).await;
            }
        });
        governor.timers.register(
            "session-chain-pump",
            TimerKind::Interval,
            "routes chain facade events to session workers",
            chain_pump,
        );

        let sched_manager = Arc::clone(self);
        let sched_pump = tokio::spawn(async move {
            while let Some(event) = sched_rx.recv().await {
                let (session, edge) = match event {
                    SchedEvent::HopSubmitted {
                        session,
                        hop_index,
                        txid,
                    } => (session, SessionEdge::HopSubmitted { hop_index, txid }),
                    SchedEvent::HopConfirmed {
                        session,
                        hop_index,
                    } => (session, SessionEdge::HopConfirmed { hop_index }),
                    SchedEvent::HopFailed {
                        session,
                        hop_index,
                        reason,
                    } => (session, SessionEdge::HopFailed { hop_index, reason }),
                    SchedEvent::ChangeSubmitted { session, txid } => {
                        (session, SessionEdge::ChangeSubmitted { txid })
                    }
                    SchedEvent::HopsCancelled { session } => {
                        (session, SessionEdge::HopsCancelled)
                    }
                };
                sched_manager.dispatch(session, edge).await;
            }
        });
        governor.timers.register(
            "session-sched-pump",
            TimerKind::Interval,
            "routes scheduler events to session workers",
            sched_pump,
        );
    }

    /// Crash recovery: respawn workers and re-arm watches for everything
    /// that was mid-flight when the process stopped.
    fn resume(self: &Arc<Self>) -> Result<(), MixError> {
        let live = self.store.iter_live_sessions()?;
        if live.is_empty() {
            return Ok(());
        }
        info!(sessions = live.len(), "resuming live sessions");
        for session in live {
            let id = session.session_id;
            match &session.state {
                SessionState::AwaitingDeposit | SessionState::DepositDetected { .. } => {
                    self.arm_deposit_watch(&session)?;
                }
                SessionState::Pooled { .. } => {
                    self.spawn_promotion_poller(id);
                }
                SessionState::Scheduled { .. } | SessionState::Releasing { .. } => {
                    if let Some(plan) = self.store.get_plan(&id)? {
                        let sched = self.sched.clone();
                        tokio::spawn(async move {
                            let _ = sched.send(SchedCommand::Schedule { plan }).await;
                        });
                    }
                }
                SessionState::Refunding { .. } => {
                    let manager = Arc::clone(self);
                    let amount = session.expected_amount;
                    tokio::spawn(async move {
                        manager
                            .dispatch(id, SessionEdge::RefundAttempt { amount })
                            .await;
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Public operations ────────────────────────────────────────────────────

    pub async fn create(self: &Arc<Self>, request: CreateRequest) -> Result<SessionView, MixError> {
        if self.governor.is_under_pressure() {
            return Err(MixError::Backpressure(request.currency));
        }
        let cc = self.config.currency(request.currency)?;
        if request.amount < cc.min_amount {
            return Err(MixError::AmountBelowMinimum {
                min: cc.min_amount,
                got: request.amount,
            });
        }
        if request.amount > cc.max_amount {
            return Err(MixError::AmountAboveMaximum {
                max: cc.max_amount,
                got: request.amount,
            });
        }
        validate_outputs(&request.outputs)?;
        let fee_bps = request.fee_bps.unwrap_or(self.config.mixing.fee_bps_default);
        validate_fee_bps(fee_bps)?;
        for output in &request.outputs {
            if !self
                .facade
                .validate_address(request.currency, output.address.as_str())?
            {
                return Err(MixError::InvalidAddress {
                    currency: request.currency,
                    address: output.address.as_str().to_string(),
                });
            }
        }
        if !self
            .facade
            .validate_address(request.currency, request.refund_address.as_str())?
        {
            return Err(MixError::InvalidAddress {
                currency: request.currency,
                address: request.refund_address.as_str().to_string(),
            });
        }

        let now = chrono::Utc::now().timestamp();
        let session_id = rng::session_id();

        // Provisioning talks to the chain node (wallet import); transient
        // failures are retried, everything else surfaces to the caller.
        let context =
            ErrorContext::for_session("session", "provision_deposit_address", session_id);
        let outcome = execute_with_retry(&context, RetryStrategy::default(), |_| {
            let facade = Arc::clone(&self.facade);
            let currency = request.currency;
            async move { facade.provision_deposit_address(currency, session_id).await }
        })
        .await;
        let deposit_address = match outcome.result {
            Some(address) => address,
            None => {
                return Err(outcome
                    .error
                    .unwrap_or_else(|| MixError::Internal("provisioning failed".into())))
            }
        };

        let mut session = Session {
            session_id,
            currency: request.currency,
            deposit_address: deposit_address.clone(),
            expected_amount: request.amount,
            outputs: request.outputs,
            fee_bps,
            refund_address: request.refund_address,
            created_at: now,
            expires_at: now + self.config.mixing.session_ttl_s,
            state: SessionState::Created,
            deposit_txid: None,
            deposit_confirmations: 0,
            attempts: 0,
            audit_len: 0,
        };
        self.store.cas_session(None, &session)?;
        let currency_code = session.currency.code();
        self.append_audit(
            &mut session,
            EventKind::StateTransition,
            Severity::Low,
            "create",
            serde_json::json!({ "currency": currency_code, "state": "created" }),
        )?;

        self.transition(&mut session, SessionState::AwaitingDeposit, "provisioned")?;
        self.arm_deposit_watch(&session)?;
        info!(session = %session_id, currency = %session.currency, "session created");
        Ok(self.view(&session))
    }

    pub fn store(&self) -> &Arc<MixStore> {
        &self.store
    }

    /// Push an expire edge (from the sweep task).
    pub async fn expire(self: &Arc<Self>, session_id: SessionId) {
        self.dispatch(session_id, SessionEdge::Expire).await;
    }

    pub fn observe(&self, session_id: &SessionId) -> Result<Option<SessionView>, MixError> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(None);
        };
        Ok(Some(self.view(&session)))
    }

    pub async fn cancel(self: &Arc<Self>, session_id: &SessionId) -> CancelOutcome {
        match self.store.get_session(session_id) {
            Ok(Some(_)) => {}
            _ => return CancelOutcome::NotFound,
        }
        let (reply, rx) = oneshot::channel();
        self.dispatch(*session_id, SessionEdge::Cancel { reply }).await;
        rx.await.unwrap_or(CancelOutcome::TooLate)
    }

    fn view(&self, session: &Session) -> SessionView {
        let hops = self
            .store
            .get_plan(&session.session_id)
            .ok()
            .flatten()
            .map(|plan| {
                plan.hops
                    .iter()
                    .map(|h| {
                        let status = match &h.status {
                            HopStatus::Pending => "pending",
                            HopStatus::Submitted { .. } => "submitted",
                            HopStatus::Confirmed { .. } => "confirmed",
                            HopStatus::Failed { .. } => "failed",
                            HopStatus::Cancelled => "cancelled",
                        };
                        (h.hop_index, status.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        SessionView {
            session_id: session.session_id,
            deposit_address: session.deposit_address.clone(),
            status: session.state.public_status().to_string(),
            deposit_confirmations: session.deposit_confirmations,
            hops,
            expires_at: session.expires_at,
        }
    }

    // ── Worker plumbing ──────────────────────────────────────────────────────

    async fn dispatch(self: &Arc<Self>, session_id: SessionId, edge: SessionEdge) {
        let now = chrono::Utc::now().timestamp();
        let sender = {
            let mut workers = self.workers.lock().expect("worker index lock");
            workers.get(&session_id, now).cloned()
        };
        let sender = match sender {
            Some(s) => s,
            None => self.spawn_worker(session_id, now),
        };
        if let Err(e) = sender.send(edge).await {
            // Worker retired between lookup and send; respawn once.
            let sender = self.spawn_worker(session_id, now);
            let _ = sender.send(e.0).await;
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        session_id: SessionId,
        now: Timestamp,
    ) -> mpsc::Sender<SessionEdge> {
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        self.workers
            .lock()
            .expect("worker index lock")
            .insert(session_id, tx.clone(), now);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(edge) = rx.recv().await {
                if let Err(e) = manager.process(session_id, edge).await {
                    warn!(session = %session_id, error = %e, "edge processing failed");
                }
                // Workers retire once their session is terminal.
                let done = manager
                    .store
                    .get_session(&session_id)
                    .ok()
                    .flatten()
                    .map(|s| s.state.is_terminal())
                    .unwrap_or(true);
                if done {
                    manager
                        .workers
                        .lock()
                        .expect("worker index lock")
                        .remove(&session_id);
                    break;
                }
            }
        });
        tx
    }

    fn arm_deposit_watch(&self, session: &Session) -> Result<(), MixError> {
        let k_c = self.facade.confirmations_required(session.currency)?;
        self.facade.watch_deposit(
            session.currency,
            session.session_id,
            session.deposit_address.clone(),
            session.expected_amount,
            k_c * REORG_WINDOW_MULTIPLIER,
            session.expires_at,
            self.chain_tx.clone(),
        )
    }

    fn spawn_promotion_poller(self: &Arc<Self>, session_id: SessionId) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let delay = exponential_backoff_ms(attempt);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                let state = manager
                    .store
                    .get_session(&session_id)
                    .ok()
                    .flatten()
                    .map(|s| s.state);
                match state {
                    Some(SessionState::Pooled { .. }) => {
                        manager.dispatch(session_id, SessionEdge::PlanAttempt).await;
                    }
                    // Promoted, failed, or gone: the poller's job is done.
                    _ => return,
                }
            }
        });
    }

    // ── Transitions & audit ──────────────────────────────────────────────────

    fn append_audit(
        &self,
        session: &mut Session,
        kind: EventKind,
        severity: Severity,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<(), MixError> {
        let now = chrono::Utc::now().timestamp();
        self.audit.append(
            StreamId::Session(session.session_id),
            now,
            kind,
            severity,
            "session",
            operation,
            Some(session.session_id),
            payload,
        )?;
        session.audit_len += 1;
        self.store.put_session(session)?;
        Ok(())
    }

    /// Apply a state transition: reject invalid edges (no-op), persist the
    /// new state, then append exactly one audit event. Returns whether the
    /// transition happened.
    fn transition(
        &self,
        session: &mut Session,
        new_state: SessionState,
        operation: &str,
    ) -> Result<bool, MixError> {
        if !crate::state::can_transition(&session.state, &new_state) {
            debug!(
                session = %session.session_id,
                from = session.state.name(),
                to = new_state.name(),
                "transition rejected"
            );
            return Ok(false);
        }
        let from = session.state.name();
        let severity = match &new_state {
            SessionState::Failed { .. } => Severity::High,
            _ => Severity::Low,
        };
        session.state = new_state;
        self.store.put_session(session)?;
        self.append_audit(
            session,
            EventKind::StateTransition,
            severity,
            operation,
            serde_json::json!({ "from": from, "to": session.state.name() }),
        )?;
        info!(
            session = %session.session_id,
            from,
            to = session.state.name(),
            "state transition"
        );
        if session.state.is_terminal() {
            self.destroy_key(session)?;
        }
        Ok(true)
    }

    /// Key-material erasure on terminal states, audited.
    fn destroy_key(&self, session: &mut Session) -> Result<(), MixError> {
        if self.store.vault().contains(&session.session_id) {
            self.store.vault().destroy(&session.session_id)?;
            self.append_audit(
                session,
                EventKind::KeyDestroyed,
                Severity::Low,
                "destroy_key",
                serde_json::json!({}),
            )?;
        }
        Ok(())
    }

    // ── Edge processing ──────────────────────────────────────────────────────

    async fn process(self: &Arc<Self>, session_id: SessionId, edge: SessionEdge) -> Result<(), MixError> {
        let Some(mut session) = self.store.get_session(&session_id)? else {
            warn!(session = %session_id, "edge for unknown session");
            return Ok(());
        };
        let now = chrono::Utc::now().timestamp();

        match edge {
            SessionEdge::DepositSeen { txid, amount } => {
                if session.state != SessionState::AwaitingDeposit {
                    return Ok(());
                }
                session.deposit_txid = Some(txid.clone());
                self.store.put_session(&session)?;

                if amount != session.expected_amount {
                    // Exact-match policy: both over- and under-payments are
                    // returned rather than mixed. Mismatches go through the
                    // refund path even when tiny — issue_refund handles the
                    // case where the refund itself would be dust, and the
                    // deposit key must outlive the payout.
                    warn!(
                        session = %session_id,
                        expected = session.expected_amount,
                        observed = amount,
                        "deposit amount mismatch"
                    );
                    if self.transition(
                        &mut session,
                        SessionState::Refunding { started_at: now },
                        "amount_mismatch",
                    )? {
                        self.issue_refund(&mut session, amount).await?;
                    }
                    return Ok(());
                }

                let fee = amount * session.fee_bps as Amount / 10_000;
                let net = amount - fee;
                let ladder = self.pool.ladder(session.currency)?;
                let (counts, _) = ladder.split(net);
                if counts.is_empty() {
                    // Exact-match deposits sit above the smallest rung by
                    // create-time amount validation; this only trips when
                    // the ladder config changed under a live session.
                    self.transition(
                        &mut session,
                        SessionState::Failed {
                            reason: FailureReason::AmountTooSmall,
                            failed_at: now,
                        },
                        "deposit_too_small",
                    )?;
                    return Ok(());
                }
                self.transition(
                    &mut session,
                    SessionState::DepositDetected { txid, seen_at: now },
                    "deposit_seen",
                )?;
            }

            SessionEdge::DepositConfirmations { confirmations } => {
                session.deposit_confirmations = confirmations;
                self.store.put_session(&session)?;
                let k_c = self.facade.confirmations_required(session.currency)?;
                if matches!(session.state, SessionState::DepositDetected { .. })
                    && confirmations >= k_c
                {
                    self.transition(
                        &mut session,
                        SessionState::DepositConfirmed { confirmations },
                        "deposit_confirmed",
                    )?;
                }
                // Absorption re-enters on later confirmation edges if an
                // earlier attempt failed mid-way; the origin guard keeps a
                // deposit from being counted twice.
                if matches!(session.state, SessionState::DepositConfirmed { .. }) {
                    let net = session.mix_value();
                    if !self
                        .pool
                        .origin_present(session.currency, session_id)?
                    {
                        self.pool
                            .absorb(session_id, session.currency, net, now)?;
                        self.append_audit(
                            &mut session,
                            EventKind::PoolMutation,
                            Severity::Low,
                            "pool_absorb",
                            serde_json::json!({ "net": net.to_string() }),
                        )?;
                    }
                    self.transition(
                        &mut session,
                        SessionState::Pooled { pooled_at: now },
                        "pooled",
                    )?;
                    self.try_promote(&mut session, now).await?;
                    if matches!(session.state, SessionState::Pooled { .. }) {
                        self.spawn_promotion_poller(session_id);
                    }
                }
            }

            SessionEdge::PlanAttempt => {
                if matches!(session.state, SessionState::Pooled { .. }) {
                    self.try_promote(&mut session, now).await?;
                }
            }

            SessionEdge::HopSubmitted { hop_index, txid } => {
                if matches!(session.state, SessionState::Scheduled { .. }) {
                    self.transition(
                        &mut session,
                        SessionState::Releasing {
                            first_fired_at: now,
                        },
                        "first_hop_fired",
                    )?;
                }
                self.append_audit(
                    &mut session,
                    EventKind::BroadcastSubmitted,
                    Severity::Low,
                    "hop_submitted",
                    serde_json::json!({ "hop": hop_index, "txid": txid.as_str() }),
                )?;
            }

            SessionEdge::HopConfirmed { hop_index } => {
                self.append_audit(
                    &mut session,
                    EventKind::BroadcastSettled,
                    Severity::Low,
                    "hop_confirmed",
                    serde_json::json!({ "hop": hop_index }),
                )?;
                self.settle_if_done(&mut session, now)?;
            }

            SessionEdge::HopsCancelled => {
                // A cancel may land after the last in-flight hop already
                // confirmed; re-check settlement or the session never
                // leaves Releasing.
                self.settle_if_done(&mut session, now)?;
            }

            SessionEdge::HopFailed { hop_index, reason } => {
                self.alerts.raise(
                    "mixing",
                    "scheduler",
                    AlertSeverity::Error,
                    "hop terminally rejected",
                    &format!("session {session_id} hop {hop_index}: {reason}"),
                    now,
                );
                self.transition(
                    &mut session,
                    SessionState::Failed {
                        reason: FailureReason::HopRejected,
                        failed_at: now,
                    },
                    "hop_failed",
                )?;
            }

            SessionEdge::ChangeSubmitted { txid } => {
                self.append_audit(
                    &mut session,
                    EventKind::BroadcastSubmitted,
                    Severity::Low,
                    "change_released",
                    serde_json::json!({ "txid": txid.as_str() }),
                )?;
            }

            SessionEdge::DepositReorged => {
                match session.state {
                    SessionState::DepositDetected { .. } => {
                        self.transition(
                            &mut session,
                            SessionState::Failed {
                                reason: FailureReason::DepositReorged,
                                failed_at: now,
                            },
                            "deposit_reorged",
                        )?;
                    }
                    SessionState::DepositConfirmed { .. } | SessionState::Pooled { .. } => {
                        let (removed, spent) = self
                            .pool
                            .retract_origin(session.currency, session_id)?;
                        if spent > 0 {
                            self.alerts.raise(
                                "mixing",
                                "pool",
                                AlertSeverity::Critical,
                                "reorged deposit already partially mixed",
                                &format!(
                                    "session {session_id}: {spent} entries spent, {removed} retracted"
                                ),
                                now,
                            );
                        }
                        self.transition(
                            &mut session,
                            SessionState::Failed {
                                reason: FailureReason::DepositReorged,
                                failed_at: now,
                            },
                            "deposit_reorged",
                        )?;
                    }
                    SessionState::Scheduled { .. } | SessionState::Releasing { .. } => {
                        // Funds already moving; a human has to reconcile.
                        self.alerts.raise(
                            "mixing",
                            "chain",
                            AlertSeverity::Critical,
                            "deposit reorged after release began",
                            &format!("session {session_id}"),
                            now,
                        );
                    }
                    _ => {}
                }
            }

            SessionEdge::RefundAttempt { amount } => {
                if matches!(session.state, SessionState::Refunding { .. }) {
                    self.issue_refund(&mut session, amount).await?;
                }
            }

            SessionEdge::Expire => match session.state {
                SessionState::Created | SessionState::AwaitingDeposit => {
                    self.transition(
                        &mut session,
                        SessionState::Expired { expired_at: now },
                        "expired",
                    )?;
                }
                SessionState::Pooled { .. } if session.is_expired(now) => {
                    self.refund_from_pool(&mut session, now).await?;
                }
                _ => {}
            },

            SessionEdge::Cancel { reply } => {
                let outcome = match session.state {
                    SessionState::Created | SessionState::AwaitingDeposit => {
                        self.transition(
                            &mut session,
                            SessionState::Cancelled { cancelled_at: now },
                            "cancelled",
                        )?;
                        CancelOutcome::Ok
                    }
                    SessionState::DepositConfirmed { .. } | SessionState::Pooled { .. } => {
                        self.refund_from_pool(&mut session, now).await?;
                        CancelOutcome::Ok
                    }
                    SessionState::Scheduled { .. } | SessionState::Releasing { .. } => {
                        // Pending hops are cancellable; submitted ones run
                        // to confirmation.
                        let _ = self
                            .sched
                            .send(SchedCommand::CancelPending {
                                session: session_id,
                            })
                            .await;
                        CancelOutcome::TooLate
                    }
                    _ => CancelOutcome::TooLate,
                };
                let _ = reply.send(outcome);
            }
        }
        Ok(())
    }

    /// Terminal check once every hop has settled (confirmed, failed, or
    /// cancelled). All confirmed ⇒ Completed. A failed hop, or cancelled
    /// hops whose value never reached the chain and cannot be compensated
    /// mid-release, ⇒ Failed.
    fn settle_if_done(&self, session: &mut Session, now: Timestamp) -> Result<(), MixError> {
        let Some(plan) = self.store.get_plan(&session.session_id)? else {
            return Ok(());
        };
        if !plan.all_settled() {
            return Ok(());
        }
        let any_failed = plan
            .hops
            .iter()
            .any(|h| matches!(h.status, HopStatus::Failed { .. }));
        let undelivered: Amount = plan
            .hops
            .iter()
            .filter(|h| h.status == HopStatus::Cancelled)
            .map(|h| h.amount)
            .sum();
        if any_failed {
            self.transition(
                session,
                SessionState::Failed {
                    reason: FailureReason::HopRejected,
                    failed_at: now,
                },
                "hop_settled_failed",
            )?;
        } else if undelivered > 0 {
            self.transition(
                session,
                SessionState::Failed {
                    reason: FailureReason::Internal("unissued hops cancelled".into()),
                    failed_at: now,
                },
                "cancelled_mid_release",
            )?;
        } else {
            self.transition(
                session,
                SessionState::Completed { completed_at: now },
                "all_hops_confirmed",
            )?;
        }
        Ok(())
    }

    /// Pool → Scheduled promotion: select under the anonymity floor, build
    /// the plan, persist it, and hand it to the scheduler. Shortfalls are
    /// not errors; the poller keeps trying until `expires_at`, then the
    /// session refunds.
    async fn try_promote(
        self: &Arc<Self>,
        session: &mut Session,
        now: Timestamp,
    ) -> Result<(), MixError> {
        let net = session.mix_value();
        let ladder = self.pool.ladder(session.currency)?;
        let (_, residual) = ladder.split(net);
        let target = net - residual;

        match self.pool.select(
            session.currency,
            target,
            session.session_id,
            self.config.mixing.k_min,
            now,
        ) {
            Ok(selection) => {
                let change_entry =
                    self.pool
                        .take_fractional(session.currency, session.session_id, now)?;
                let params = PlanParams::from(&self.config.mixing);
                let plan = build_plan(session, &selection, change_entry.as_ref(), &params, now)?;
                self.store.put_plan(&plan)?;
                self.transition(
                    session,
                    SessionState::Scheduled { scheduled_at: now },
                    "plan_ready",
                )?;
                self.sched
                    .send(SchedCommand::Schedule { plan })
                    .await
                    .map_err(|_| MixError::Shutdown)?;
            }
            Err(MixError::InsufficientAnonymity { need, got }) => {
                debug!(session = %session.session_id, need, got, "anonymity floor not met");
                if session.is_expired(now) {
                    self.refund_from_pool(session, now).await?;
                }
            }
            Err(MixError::InsufficientLiquidity { .. }) => {
                if session.is_expired(now) {
                    self.refund_from_pool(session, now).await?;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Refund a session whose funds sit (unmixed) in the pool: retract the
    /// inventory, then return the deposit minus network fee.
    async fn refund_from_pool(
        self: &Arc<Self>,
        session: &mut Session,
        now: Timestamp,
    ) -> Result<(), MixError> {
        let (removed, spent) = self
            .pool
            .retract_origin(session.currency, session.session_id)?;
        if spent > 0 {
            self.alerts.raise(
                "mixing",
                "pool",
                AlertSeverity::Critical,
                "refund requested but entries already mixed",
                &format!(
                    "session {}: {spent} spent, {removed} retracted",
                    session.session_id
                ),
                now,
            );
        }
        if self.transition(
            session,
            SessionState::Refunding { started_at: now },
            "refund_started",
        )? {
            self.issue_refund(session, session.expected_amount).await?;
        }
        Ok(())
    }

    /// Rough network cost of a single refund transfer, in minor units.
    fn refund_network_fee(&self, currency: Currency, rate: u64) -> Amount {
        match currency.family() {
            // ~200 vbytes at the estimated rate.
            ChainFamily::Utxo | ChainFamily::AccountShielded => rate as Amount * 200,
            // 21000 gas at `rate` gwei.
            ChainFamily::Account => rate as Amount * 21_000 * 1_000_000_000,
            // Flat per-signature lamports.
            ChainFamily::HighThroughput => 5_000,
        }
    }

    /// Issue the single refund output. The nonce is derived from the
    /// session id, so a retried refund can never pay twice.
    async fn issue_refund(
        self: &Arc<Self>,
        session: &mut Session,
        gross: Amount,
    ) -> Result<(), MixError> {
        let now = chrono::Utc::now().timestamp();
        let Some(deposit_txid) = session.deposit_txid.clone() else {
            return Err(MixError::Internal("refund without deposit txid".into()));
        };
        let rate = self
            .facade
            .estimate_fee(session.currency, 1)
            .await
            .unwrap_or(1);
        let amount = gross.saturating_sub(self.refund_network_fee(session.currency, rate));
        if amount == 0 {
            self.transition(
                session,
                SessionState::Failed {
                    reason: FailureReason::AmountTooSmall,
                    failed_at: now,
                },
                "refund_dust",
            )?;
            return Ok(());
        }

        let mut nonce_seed = session.session_id.as_bytes().to_vec();
        nonce_seed.extend_from_slice(b"refund");
        let digest = blake3_hash(&nonce_seed);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&digest[..16]);

        let intent = TxIntent {
            currency: session.currency,
            session_id: session.session_id,
            hop_index: u32::MAX,
            inputs: vec![FundingSource {
                origin: session.session_id,
                deposit_txid,
                deposit_address: session.deposit_address.clone(),
                amount: gross,
            }],
            to: session.refund_address.clone(),
            amount,
            nonce: HopNonce(nonce),
            fee_rate: rate,
        };

        match self.facade.broadcast_hop(&intent).await {
            Ok(handle) => {
                self.transition(
                    session,
                    SessionState::Refunded {
                        refunded_at: now,
                        txid: handle.txid,
                    },
                    "refunded",
                )?;
            }
            Err(e) if e.recovery().can_recover => {
                session.attempts += 1;
                self.store.put_session(session)?;
                let delay = exponential_backoff_ms(session.attempts);
                let manager = Arc::clone(self);
                let session_id = session.session_id;
                debug!(session = %session_id, error = %e, "refund deferred");
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    manager
                        .dispatch(session_id, SessionEdge::RefundAttempt { amount: gross })
                        .await;
                });
            }
            Err(e) => {
                self.alerts.raise(
                    "mixing",
                    "session",
                    AlertSeverity::Critical,
                    "refund failed terminally",
                    &format!("session {}: {e}", session.session_id),
                    now,
                );
                self.transition(
                    session,
                    SessionState::Failed {
                        reason: FailureReason::ChainFailure,
                        failed_at: now,
                    },
                    "refund_failed",
                )?;
            }
        }
        Ok(())
    }
}
