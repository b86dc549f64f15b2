use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use obscura_core::broadcast::{Broadcast, BroadcastStatus};
use obscura_core::config::MixingConfig;
use obscura_core::constants::CONFIRMATION_POLL_INTERVAL_SECS;
use obscura_core::error::MixError;
use obscura_core::plan::{HopStatus, ReleasePlan};
use obscura_core::retry::exponential_backoff_ms;
use obscura_core::types::{Amount, ChainTxId, Currency, SessionId, Timestamp};
use obscura_chain::{ChainFacade, FundingSource, TxIntent};
use obscura_crypto::rng;
use obscura_health::HealthStatus;
use obscura_pool::LiquidityPool;
use obscura_store::MixStore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cadence for re-checking endpoint health for the backpressure map.
const BACKPRESSURE_POLL_SECS: u64 = 5;

/// Requeue delay when a due hop's currency is paused.
const PAUSED_REQUEUE_SECS: i64 = 15;

// ── Commands & events ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SchedCommand {
    /// Enqueue a persisted plan's pending hops.
    Schedule { plan: ReleasePlan },
    /// Cancel hops that have not been submitted. In-flight hops run to
    /// confirmation; chain effects are irreversible.
    CancelPending { session: SessionId },
}

/// Edges the scheduler pushes back to the session machine.
#[derive(Clone, Debug)]
pub enum SchedEvent {
    HopSubmitted {
        session: SessionId,
        hop_index: u32,
        txid: ChainTxId,
    },
    HopConfirmed {
        session: SessionId,
        hop_index: u32,
    },
    HopFailed {
        session: SessionId,
        hop_index: u32,
        reason: String,
    },
    ChangeSubmitted {
        session: SessionId,
        txid: ChainTxId,
    },
    /// Pending hops were cancelled; the plan may now be fully settled.
    HopsCancelled {
        session: SessionId,
    },
}

// ── Scheduler ────────────────────────────────────────────────────────────────

struct WatchedHop {
    session: SessionId,
    hop_index: u32,
    txid: ChainTxId,
    currency: Currency,
    threshold: u32,
}

/// The execution fiber. One per process: wakes on the earliest pending
/// `fire_at`, submits due hops, and keeps watching confirmations even when
/// new submissions are paused for a currency.
pub struct Scheduler {
    facade: Arc<ChainFacade>,
    pool: Arc<LiquidityPool>,
    store: Arc<MixStore>,
    mixing: MixingConfig,
    commands: mpsc::Receiver<SchedCommand>,
    events: mpsc::Sender<SchedEvent>,
    heap: BinaryHeap<Reverse<(Timestamp, u64, SessionId, u32)>>,
    seq: u64,
    watched: Vec<WatchedHop>,
    /// (session, hop) → fee bumps spent.
    fee_bumps: HashMap<(SessionId, u32), u32>,
    /// (session, hop) → rejection retries spent.
    attempts: HashMap<(SessionId, u32), u32>,
    paused: HashSet<Currency>,
}

impl Scheduler {
    pub fn new(
        facade: Arc<ChainFacade>,
        pool: Arc<LiquidityPool>,
        store: Arc<MixStore>,
        mixing: MixingConfig,
        events: mpsc::Sender<SchedEvent>,
    ) -> (Self, mpsc::Sender<SchedCommand>) {
        let (tx, rx) = mpsc::channel(obscura_core::constants::SCHEDULER_QUEUE_DEPTH);
        (
            Self {
                facade,
                pool,
                store,
                mixing,
                commands: rx,
                events,
                heap: BinaryHeap::new(),
                seq: 0,
                watched: Vec::new(),
                fee_bumps: HashMap::new(),
                attempts: HashMap::new(),
                paused: HashSet::new(),
            },
            tx,
        )
    }

    fn enqueue(&mut self, fire_at: Timestamp, session: SessionId, hop_index: u32) {
        self.seq += 1;
        self.heap
            .push(Reverse((fire_at, self.seq, session, hop_index)));
    }

    /// Drive the scheduler. Runs until every command sender is dropped.
    pub async fn run(mut self) {
        let mut confirm_tick =
            tokio::time::interval(Duration::from_secs(CONFIRMATION_POLL_INTERVAL_SECS));
        confirm_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pause_tick =
            tokio::time::interval(Duration::from_secs(BACKPRESSURE_POLL_SECS));
        pause_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("scheduler running");
        loop {
            let now = chrono::Utc::now().timestamp();
            let wake = self
                .heap
                .peek()
                .map(|Reverse((fire_at, ..))| (*fire_at - now).max(0) as u64)
                .unwrap_or(3_600);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(c) => self.handle_command(c).await,
                    None => {
                        info!("scheduler shutting down");
                        return;
                    }
                },
                _ = tokio::time::sleep(Duration::from_secs(wake)) => {
                    self.fire_due().await;
                }
                _ = confirm_tick.tick() => {
                    self.poll_confirmations().await;
                }
                _ = pause_tick.tick() => {
                    self.update_backpressure();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SchedCommand) {
        match command {
            SchedCommand::Schedule { plan } => {
                let session = plan.session_id;
                for hop in &plan.hops {
                    if hop.status == HopStatus::Pending {
                        self.enqueue(hop.fire_at, session, hop.hop_index);
                    }
                }
                debug!(session = %session, hops = plan.hops.len(), "plan scheduled");
            }
            SchedCommand::CancelPending { session } => {
                match self.cancel_pending(session) {
                    Ok(()) => {
                        let _ = self
                            .events
                            .send(SchedEvent::HopsCancelled { session })
                            .await;
                    }
                    Err(e) => warn!(session = %session, error = %e, "cancel failed"),
                }
            }
        }
    }

    fn cancel_pending(&mut self, session: SessionId) -> Result<(), MixError> {
        let Some(mut plan) = self.store.get_plan(&session)? else {
            return Ok(());
        };
        let mut cancelled = 0;
        for hop in &mut plan.hops {
            if hop.status == HopStatus::Pending {
                hop.status = HopStatus::Cancelled;
                cancelled += 1;
            }
        }
        if let Some(change) = &mut plan.change {
            if change.status == HopStatus::Pending {
                change.status = HopStatus::Cancelled;
            }
        }
        self.store.put_plan(&plan)?;
        self.pool.release_for_session(plan.currency, session)?;
        info!(session = %session, cancelled, "pending hops cancelled");
        Ok(())
    }

    fn update_backpressure(&mut self) {
        for currency in self.facade.currencies() {
            let Ok(snapshot) = self.facade.health(currency) else {
                continue;
            };
            let degraded = matches!(
                snapshot.status,
                HealthStatus::Degraded | HealthStatus::Failed
            );
            if degraded && self.paused.insert(currency) {
                warn!(%currency, "submissions paused (endpoint unhealthy)");
            } else if !degraded && self.paused.remove(&currency) {
                info!(%currency, "submissions resumed");
            }
        }
    }

    async fn fire_due(&mut self) {
        let now = chrono::Utc::now().timestamp();
        let mut due = Vec::new();
        while let Some(Reverse((fire_at, ..))) = self.heap.peek() {
            if *fire_at > now {
                break;
            }
            let Reverse((_, _, session, hop_index)) = self.heap.pop().expect("peeked");
            due.push((session, hop_index));
        }
        for (session, hop_index) in due {
            self.submit_hop(session, hop_index, now).await;
        }
    }

    /// Gather funding that covers `amount` from the session's still-held
    /// reservations, oldest reservation order.
    fn gather_funding(
        &self,
        plan: &ReleasePlan,
        amount: Amount,
    ) -> Result<(Vec<FundingSource>, Vec<obscura_core::types::PoolEntryId>), MixError> {
        let mut sources = Vec::new();
        let mut used = Vec::new();
        let mut covered: Amount = 0;
        for entry_id in &plan.reserved_entries {
            if covered >= amount {
                break;
            }
            let Some(entry) = self.store.get_pool_entry(entry_id)? else {
                continue;
            };
            if !entry.is_reserved_for(&plan.session_id) {
                continue;
            }
            let origin = self
                .store
                .get_session(&entry.origin_session_id)?
                .ok_or_else(|| MixError::SessionNotFound(entry.origin_session_id.to_hex()))?;
            let deposit_txid = origin
                .deposit_txid
                .clone()
                .ok_or_else(|| MixError::Internal("pooled origin without deposit txid".into()))?;
            covered += entry.amount;
            used.push(entry.pool_entry_id);
            sources.push(FundingSource {
                origin: origin.session_id,
                deposit_txid,
                deposit_address: origin.deposit_address.clone(),
                amount: entry.amount,
            });
        }
        if covered < amount {
            return Err(MixError::InsufficientLiquidity {
                currency: plan.currency,
                need: amount,
                have: covered,
            });
        }
        Ok((sources, used))
    }

    async fn submit_hop(&mut self, session: SessionId, hop_index: u32, now: Timestamp) {
        let plan = match self.store.get_plan(&session) {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                warn!(session = %session, error = %e, "plan load failed");
                return;
            }
        };
        let currency = plan.currency;
        let Some(hop) = plan.hops.iter().find(|h| h.hop_index == hop_index) else {
            return;
        };
        // Re-applied or cancelled edges are no-ops.
        if hop.status != HopStatus::Pending {
            return;
        }

        if self.paused.contains(&currency) {
            self.enqueue(now + PAUSED_REQUEUE_SECS, session, hop_index);
            return;
        }

        let key = (session, hop_index);
        let bumps = *self.fee_bumps.get(&key).unwrap_or(&0);
        let threshold = self.facade.confirmations_required(currency).unwrap_or(1);
        let base_rate = match self.facade.estimate_fee(currency, threshold).await {
            Ok(rate) => rate,
            Err(_) => {
                self.requeue_transient(session, hop_index, now);
                return;
            }
        };
        let fee_rate = self
            .facade
            .bumped_rate(currency, base_rate, bumps)
            .unwrap_or(base_rate);

        let (inputs, used_entries) = match self.gather_funding(&plan, hop.amount) {
            Ok(f) => f,
            Err(e) => {
                warn!(session = %session, hop_index, error = %e, "funding gather failed");
                self.fail_hop(session, hop_index, e.to_string()).await;
                return;
            }
        };

        let intent = TxIntent {
            currency,
            session_id: session,
            hop_index,
            inputs,
            to: hop.to_address.clone(),
            amount: hop.amount,
            nonce: hop.nonce,
            fee_rate,
        };

        match self.facade.broadcast_hop(&intent).await {
            Ok(handle) => {
                let mut plan = plan;
                if let Some(h) = plan.hops.iter_mut().find(|h| h.hop_index == hop_index) {
                    h.status = HopStatus::Submitted {
                        txid: handle.txid.clone(),
                        submitted_at: now,
                    };
                }
                if let Err(e) = self.store.put_plan(&plan) {
                    warn!(session = %session, error = %e, "plan persist failed");
                }
                let record = Broadcast {
                    broadcast_id: handle.broadcast_id,
                    currency,
                    session_id: session,
                    hop_index,
                    amount: intent.amount,
                    raw_tx: Vec::new(),
                    txid: Some(handle.txid.clone()),
                    submitted_at: Some(now),
                    confirmations: 0,
                    status: BroadcastStatus::Submitted,
                };
                let _ = self.store.put_broadcast(&record);
                let _ = self.pool.consume(currency, &used_entries, now);
                self.watched.push(WatchedHop {
                    session,
                    hop_index,
                    txid: handle.txid.clone(),
                    currency,
                    threshold,
                });
                let _ = self
                    .events
                    .send(SchedEvent::HopSubmitted {
                        session,
                        hop_index,
                        txid: handle.txid,
                    })
                    .await;

                self.maybe_submit_change(&mut plan, now).await;
            }
            Err(MixError::BroadcastRejected { reason, terminal }) => {
                let attempts = self.attempts.entry(key).or_insert(0);
                *attempts += 1;
                let exhausted = *attempts > self.mixing.retry_budget
                    || bumps + 1 > self.mixing.max_fee_bumps;
                if terminal || exhausted {
                    self.fail_hop(session, hop_index, reason).await;
                } else {
                    // Bump the fee, back off, resubmit the same nonce.
                    self.fee_bumps.insert(key, bumps + 1);
                    let delay = (exponential_backoff_ms(*attempts) / 1_000) as i64;
                    debug!(session = %session, hop_index, reason, "retryable rejection");
                    self.enqueue(now + delay.max(1), session, hop_index);
                }
            }
            Err(e) if e.recovery().can_recover => {
                debug!(session = %session, hop_index, error = %e, "transient submit failure");
                self.requeue_transient(session, hop_index, now);
            }
            Err(e) => {
                self.fail_hop(session, hop_index, e.to_string()).await;
            }
        }
    }

    fn requeue_transient(&mut self, session: SessionId, hop_index: u32, now: Timestamp) {
        let key = (session, hop_index);
        let attempts = self.attempts.entry(key).or_insert(0);
        *attempts += 1;
        let delay = (exponential_backoff_ms(*attempts) / 1_000) as i64;
        let jittered = rng::draw_uniform(delay.max(1), delay.max(1) + delay / 5 + 1);
        self.enqueue(now + jittered, session, hop_index);
    }

    /// The fractional residual rides along with the first successful hop.
    async fn maybe_submit_change(&mut self, plan: &mut ReleasePlan, now: Timestamp) {
        let session = plan.session_id;
        let currency = plan.currency;
        let Some(change) = plan.change.as_mut() else {
            return;
        };
        if change.status != HopStatus::Pending {
            return;
        }
        let Ok(Some(session_row)) = self.store.get_session(&session) else {
            return;
        };
        let Some(deposit_txid) = session_row.deposit_txid.clone() else {
            return;
        };
        let intent = TxIntent {
            currency,
            session_id: session,
            hop_index: u32::MAX,
            inputs: vec![FundingSource {
                origin: session,
                deposit_txid,
                deposit_address: session_row.deposit_address.clone(),
                amount: change.amount,
            }],
            to: change.address.clone(),
            amount: change.amount,
            nonce: change.nonce,
            fee_rate: 1,
        };
        match self.facade.broadcast_hop(&intent).await {
            Ok(handle) => {
                change.status = HopStatus::Submitted {
                    txid: handle.txid.clone(),
                    submitted_at: now,
                };
                let _ = self.store.put_plan(plan);
                let _ = self
                    .events
                    .send(SchedEvent::ChangeSubmitted {
                        session,
                        txid: handle.txid,
                    })
                    .await;
            }
            Err(e) => {
                // Left Pending; it will ride with the next hop submission.
                debug!(session = %session, error = %e, "change release deferred");
            }
        }
    }

    async fn fail_hop(&mut self, session: SessionId, hop_index: u32, reason: String) {
        warn!(session = %session, hop_index, reason, "hop failed terminally");
        if let Ok(Some(mut plan)) = self.store.get_plan(&session) {
            if let Some(h) = plan.hops.iter_mut().find(|h| h.hop_index == hop_index) {
                h.status = HopStatus::Failed {
                    reason: reason.clone(),
                };
            }
            let _ = self.store.put_plan(&plan);
            let _ = self.pool.release_for_session(plan.currency, session);
        }
        let _ = self
            .events
            .send(SchedEvent::HopFailed {
                session,
                hop_index,
                reason,
            })
            .await;
    }

    async fn poll_confirmations(&mut self) {
        let now = chrono::Utc::now().timestamp();
        let mut still_watching = Vec::new();
        let watched = std::mem::take(&mut self.watched);
        for hop in watched {
            match self.facade.confirmations(hop.currency, &hop.txid).await {
                Ok(count) if count >= hop.threshold => {
                    if let Ok(Some(mut plan)) = self.store.get_plan(&hop.session) {
                        if let Some(h) = plan
                            .hops
                            .iter_mut()
                            .find(|h| h.hop_index == hop.hop_index)
                        {
                            h.status = HopStatus::Confirmed { confirmed_at: now };
                        }
                        let _ = self.store.put_plan(&plan);
                    }
                    let _ = self
                        .events
                        .send(SchedEvent::HopConfirmed {
                            session: hop.session,
                            hop_index: hop.hop_index,
                        })
                        .await;
                }
                Ok(_) => still_watching.push(hop),
                Err(e) => {
                    debug!(txid = %hop.txid, error = %e, "confirmation poll failed");
                    still_watching.push(hop);
                }
            }
        }
        self.watched = still_watching;
    }
}
