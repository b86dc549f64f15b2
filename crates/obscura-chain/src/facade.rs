//! The chain facade: the one surface the rest of the core talks to.
//!
//! Owns one adapter per enabled currency, the per-endpoint health probes,
//! deposit watch loops, and the nonce index that makes hop re-broadcast
//! idempotent. Everything returned from here is already lifted into
//! `MixError`; chain-native error shapes stop at the adapters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use obscura_core::config::Config;
use obscura_core::constants::{DEPOSIT_POLL_INTERVAL_SECS, HEALTH_PROBE_INTERVAL_SECS};
use obscura_core::error::MixError;
use obscura_core::types::{
    Address, Amount, ChainTxId, Currency, HopNonce, SessionId, Timestamp,
};
use obscura_crypto::keys::DepositKey;
use obscura_crypto::{derive_deposit_address, rng};
use obscura_govern::{BoundedCollection, ResourceGovernor, TimerKind};
use obscura_health::{HealthSnapshot, HealthStatus, HealthTracker};
use obscura_store::MixStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::account::AccountAdapter;
use crate::adapter::{BroadcastHandle, ChainAdapter, TxIntent};
use crate::fee::FeeEstimator;
use crate::shielded::ShieldedAdapter;
use crate::throughput::ThroughputAdapter;
use crate::transport::RpcTransport;
use crate::utxo::UtxoAdapter;

/// Mainnet chain id for the account adapter.
const ACCOUNT_CHAIN_ID: u64 = 1;

/// Nonce index bound: ample for every in-flight hop plus a replay window.
const NONCE_INDEX_CAP: usize = 65_536;

// ── Events ───────────────────────────────────────────────────────────────────

/// Asynchronous edges the facade pushes toward the session machine.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    DepositSeen {
        session: SessionId,
        txid: ChainTxId,
        amount: Amount,
    },
    DepositConfirmations {
        session: SessionId,
        confirmations: u32,
    },
    /// A previously sighted deposit vanished or its confirmations went
    /// backwards past the threshold.
    DepositReorged {
        session: SessionId,
    },
}

// ── Per-currency entry ───────────────────────────────────────────────────────

struct FacadeEntry {
    adapter: Arc<dyn ChainAdapter>,
    confirmations_required: u32,
    fees: FeeEstimator,
    health: Arc<RwLock<HealthSnapshot>>,
    health_tx: watch::Sender<HealthStatus>,
}

// ── ChainFacade ──────────────────────────────────────────────────────────────

pub struct ChainFacade {
    store: Arc<MixStore>,
    entries: HashMap<Currency, FacadeEntry>,
    /// nonce → txid of the broadcast it produced. Re-broadcasting a hop
    /// with a seen nonce returns the recorded txid instead of writing to
    /// the chain again.
    nonce_index: Arc<Mutex<BoundedCollection<HopNonce, ChainTxId>>>,
}

impl ChainFacade {
    /// Empty facade; adapters are registered explicitly (tests, custom
    /// wiring).
    pub fn new(store: Arc<MixStore>, governor: &ResourceGovernor) -> Self {
        let nonce_index = Arc::new(Mutex::new(BoundedCollection::new(
            "chain-nonce-index",
            NONCE_INDEX_CAP,
            NONCE_INDEX_CAP / 2,
            None,
        )));
        governor.collections.register(nonce_index.clone());
        Self {
            store,
            entries: HashMap::new(),
            nonce_index,
        }
    }

    /// Build the production adapter set from config.
    pub fn from_config(
        config: &Config,
        store: Arc<MixStore>,
        governor: &ResourceGovernor,
    ) -> Result<Self, MixError> {
        let mut facade = Self::new(store, governor);
        for (&currency, cc) in &config.currencies {
            let transport = RpcTransport::new(
                &cc.endpoint,
                config.transport.timeout_ms,
                cc.credentials.as_deref(),
            );
            let fees = FeeEstimator::new(cc.fee_policy.clone());
            let adapter: Arc<dyn ChainAdapter> = match currency.family() {
                obscura_core::types::ChainFamily::Utxo => {
                    Arc::new(UtxoAdapter::new(currency, transport, fees.clone()))
                }
                obscura_core::types::ChainFamily::Account => Arc::new(AccountAdapter::new(
                    currency,
                    transport,
                    fees.clone(),
                    ACCOUNT_CHAIN_ID,
                )),
                obscura_core::types::ChainFamily::AccountShielded => {
                    Arc::new(ShieldedAdapter::new(currency, transport, fees.clone()))
                }
                obscura_core::types::ChainFamily::HighThroughput => {
                    Arc::new(ThroughputAdapter::new(currency, transport, fees.clone()))
                }
            };
            facade.register_adapter(adapter, cc.confirmations_required, fees);
        }
        Ok(facade)
    }

    pub fn register_adapter(
        &mut self,
        adapter: Arc<dyn ChainAdapter>,
        confirmations_required: u32,
        fees: FeeEstimator,
    ) {
        let currency = adapter.currency();
        let endpoint_id = format!("chain-{currency}");
        let snapshot = HealthTracker::new(&endpoint_id).snapshot();
        let (health_tx, _) = watch::channel(HealthStatus::Unknown);
        self.entries.insert(
            currency,
            FacadeEntry {
                adapter,
                confirmations_required,
                fees,
                health: Arc::new(RwLock::new(snapshot)),
                health_tx,
            },
        );
    }

    fn entry(&self, currency: Currency) -> Result<&FacadeEntry, MixError> {
        self.entries
            .get(&currency)
            .ok_or(MixError::CurrencyDisabled(currency))
    }

    pub fn currencies(&self) -> Vec<Currency> {
        let mut list: Vec<_> = self.entries.keys().copied().collect();
        list.sort();
        list
    }

    pub fn confirmations_required(&self, currency: Currency) -> Result<u32, MixError> {
        Ok(self.entry(currency)?.confirmations_required)
    }

    // ── Addresses & keys ─────────────────────────────────────────────────────

    /// Provision a one-time deposit address: fresh key sealed in the vault,
    /// address derived from it, and registered with the adapter's watch.
    pub async fn provision_deposit_address(
        &self,
        currency: Currency,
        session: SessionId,
    ) -> Result<Address, MixError> {
        let entry = self.entry(currency)?;
        let key = DepositKey::generate(currency.family());
        let address = derive_deposit_address(currency, &key)?;
        self.store.vault().seal(&session, key.secret_bytes())?;
        entry
            .adapter
            .register_watch(&address)
            .await
            .map_err(|e| e.into_mix(currency))?;
        info!(%currency, session = %session, address = %address, "deposit address provisioned");
        Ok(address)
    }

    pub fn validate_address(&self, currency: Currency, address: &str) -> Result<bool, MixError> {
        Ok(self.entry(currency)?.adapter.validate_address(address))
    }

    // ── Deposit watching ─────────────────────────────────────────────────────

    /// Spawn the deposit watch loop for one session. The loop polls until
    /// the reorg window closes, the session expires, or the event channel
    /// is dropped; it emits sightings, confirmation updates, and reorgs.
    #[allow(clippy::too_many_arguments)]
    pub fn watch_deposit(
        &self,
        currency: Currency,
        session: SessionId,
        address: Address,
        expected: Amount,
        reorg_window_confs: u32,
        expires_at: Timestamp,
        events: mpsc::Sender<ChainEvent>,
    ) -> Result<(), MixError> {
        let adapter = Arc::clone(&self.entry(currency)?.adapter);
        tokio::spawn(async move {
            let mut seen: Option<ChainTxId> = None;
            let mut last_confs = 0u32;
            let mut interval =
                tokio::time::interval(Duration::from_secs(DEPOSIT_POLL_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                // Expiry closes the loop; the session machine handles the
                // expire edge from its own sweep. Sighted deposits get one
                // extra hour for the reorg window to close.
                let now = chrono::Utc::now().timestamp();
                if now >= expires_at && seen.is_none() {
                    return;
                }
                if now >= expires_at + 3_600 {
                    return;
                }
                match adapter.check_deposit(&address, expected).await {
                    Ok(Some(sighting)) => {
                        if seen.is_none() {
                            seen = Some(sighting.txid.clone());
                            if events
                                .send(ChainEvent::DepositSeen {
                                    session,
                                    txid: sighting.txid.clone(),
                                    amount: sighting.amount,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        if sighting.confirmations != last_confs {
                            last_confs = sighting.confirmations;
                            if events
                                .send(ChainEvent::DepositConfirmations {
                                    session,
                                    confirmations: sighting.confirmations,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        if sighting.confirmations >= reorg_window_confs {
                            debug!(session = %session, "reorg window closed; watch done");
                            return;
                        }
                    }
                    Ok(None) => {
                        if seen.is_some() {
                            // The sighted deposit is gone.
                            warn!(session = %session, "sighted deposit vanished");
                            let _ = events.send(ChainEvent::DepositReorged { session }).await;
                            return;
                        }
                    }
                    Err(e) => {
                        // Transient by construction: probes will flag the
                        // endpoint; the watch just keeps polling.
                        debug!(session = %session, error = %e, "deposit poll failed");
                    }
                }
            }
        });
        Ok(())
    }

    // ── Broadcasting ─────────────────────────────────────────────────────────

    /// Submit one hop. Idempotent on the hop nonce: a replay returns the
    /// original txid without touching the chain.
    pub async fn broadcast_hop(&self, intent: &TxIntent) -> Result<BroadcastHandle, MixError> {
        let entry = self.entry(intent.currency)?;
        let now = chrono::Utc::now().timestamp();

        let existing = {
            let mut index = self.nonce_index.lock().expect("nonce index lock");
            index.get(&intent.nonce, now).cloned()
        };
        if let Some(txid) = existing {
            debug!(nonce = %intent.nonce.to_hex(), "duplicate broadcast suppressed");
            return Ok(BroadcastHandle {
                broadcast_id: rng::broadcast_id(),
                currency: intent.currency,
                txid,
            });
        }

        // Unseal a signer for every funding input, just in time.
        let mut signers = Vec::with_capacity(intent.inputs.len());
        for input in &intent.inputs {
            let secret = self.store.vault().open_secret(&input.origin)?;
            signers.push(DepositKey::from_raw(intent.currency.family(), &secret)?);
        }

        let txid = entry
            .adapter
            .broadcast(intent, &signers)
            .await
            .map_err(|e| e.into_mix(intent.currency))?;

        self.nonce_index
            .lock()
            .expect("nonce index lock")
            .insert(intent.nonce, txid.clone(), now);

        Ok(BroadcastHandle {
            broadcast_id: rng::broadcast_id(),
            currency: intent.currency,
            txid,
        })
    }

    pub async fn confirmations(
        &self,
        currency: Currency,
        txid: &ChainTxId,
    ) -> Result<u32, MixError> {
        let entry = self.entry(currency)?;
        entry
            .adapter
            .confirmations(txid)
            .await
            .map_err(|e| e.into_mix(currency))
    }

    pub async fn estimate_fee(&self, currency: Currency, target: u32) -> Result<u64, MixError> {
        let entry = self.entry(currency)?;
        entry
            .adapter
            .estimate_fee(target)
            .await
            .map_err(|e| e.into_mix(currency))
    }

    pub fn bumped_rate(&self, currency: Currency, base: u64, bumps: u32) -> Result<u64, MixError> {
        Ok(self.entry(currency)?.fees.bumped_rate(base, bumps))
    }

    // ── Health ───────────────────────────────────────────────────────────────

    pub fn health(&self, currency: Currency) -> Result<HealthSnapshot, MixError> {
        Ok(self
            .entry(currency)?
            .health
            .read()
            .expect("health snapshot lock")
            .clone())
    }

    /// Subscribe to status changes; the scheduler's backpressure hangs off
    /// this channel.
    pub fn subscribe_health(&self, currency: Currency) -> Result<watch::Receiver<HealthStatus>, MixError> {
        Ok(self.entry(currency)?.health_tx.subscribe())
    }

    /// Start one probe loop per currency, registered with the governor so
    /// shutdown clears them.
    pub fn spawn_probes(self: &Arc<Self>, governor: &ResourceGovernor) {
        for (&currency, entry) in &self.entries {
            let adapter = Arc::clone(&entry.adapter);
            let published = Arc::clone(&entry.health);
            let health_tx = entry.health_tx.clone();
            let handle = tokio::spawn(async move {
                let mut tracker = HealthTracker::new(&format!("chain-{currency}"));
                let mut interval =
                    tokio::time::interval(Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let started = Instant::now();
                    let now = chrono::Utc::now().timestamp();
                    let status = match adapter.probe().await {
                        Ok(_) => tracker
                            .record_success(started.elapsed().as_millis() as u64, now),
                        Err(_) => tracker.record_failure(now),
                    };
                    *published.write().expect("health snapshot lock") = tracker.snapshot();
                    // Only publish changes; watchers wake on edges.
                    health_tx.send_if_modified(|current| {
                        if *current != status {
                            *current = status;
                            true
                        } else {
                            false
                        }
                    });
                }
            });
            governor.timers.register(
                &format!("chain-probe-{currency}"),
                TimerKind::Interval,
                "chain endpoint health probe",
                handle,
            );
        }
    }
}
