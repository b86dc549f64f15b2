use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::Arc;

use obscura_core::config::Config;
use obscura_core::error::MixError;
use obscura_core::pool::{DenominationClass, PoolEntryState, PooledAmount};
use obscura_core::types::{Amount, Currency, PoolEntryId, SessionId, Timestamp};
use obscura_crypto::rng;
use obscura_store::MixStore;
use tracing::{debug, info};

use crate::ladder::DenominationLadder;

// ── Selection ────────────────────────────────────────────────────────────────

/// The outcome of a successful coin selection: entries are already moved
/// to Reserved under the session's lease.
#[derive(Clone, Debug)]
pub struct Selection {
    pub entries: Vec<PooledAmount>,
    pub distinct_origins: usize,
}

impl Selection {
    pub fn total(&self) -> Amount {
        self.entries.iter().map(|e| e.amount).sum()
    }

    pub fn entry_ids(&self) -> Vec<PoolEntryId> {
        self.entries.iter().map(|e| e.pool_entry_id).collect()
    }
}

// ── LiquidityPool ────────────────────────────────────────────────────────────

struct Shard {
    entries: BTreeMap<PoolEntryId, PooledAmount>,
}

/// The multi-currency inventory. Sharded per currency with a single writer
/// per shard; selection and reservation happen under one write lock so
/// they are atomic with respect to other selectors. Mutations write
/// through to the store.
pub struct LiquidityPool {
    shards: HashMap<Currency, RwLock<Shard>>,
    ladders: HashMap<Currency, DenominationLadder>,
    store: Arc<MixStore>,
    lease_ttl: i64,
}

impl LiquidityPool {
    pub fn new(config: &Config, store: Arc<MixStore>) -> Result<Self, MixError> {
        let mut shards = HashMap::new();
        let mut ladders = HashMap::new();
        for (&currency, cc) in &config.currencies {
            shards.insert(
                currency,
                RwLock::new(Shard {
                    entries: BTreeMap::new(),
                }),
            );
            ladders.insert(currency, DenominationLadder::new(cc.denominations.clone())?);
        }
        let pool = Self {
            shards,
            ladders,
            store,
            lease_ttl: config.mixing.lease_ttl_s,
        };
        pool.restore()?;
        Ok(pool)
    }

    /// Reload persisted inventory after a restart.
    fn restore(&self) -> Result<(), MixError> {
        let mut restored = 0usize;
        for entry in self.store.iter_pool(None)? {
            if let Some(shard) = self.shards.get(&entry.currency) {
                shard
                    .write()
                    .expect("pool shard lock")
                    .entries
                    .insert(entry.pool_entry_id, entry);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "pool inventory restored");
        }
        Ok(())
    }

    pub fn ladder(&self, currency: Currency) -> Result<&DenominationLadder, MixError> {
        self.ladders
            .get(&currency)
            .ok_or(MixError::CurrencyDisabled(currency))
    }

    fn shard(&self, currency: Currency) -> Result<&RwLock<Shard>, MixError> {
        self.shards
            .get(&currency)
            .ok_or(MixError::CurrencyDisabled(currency))
    }

    // ── Absorption ───────────────────────────────────────────────────────────

    /// Absorb a confirmed deposit's net value (deposit − fee) as pooled
    /// inventory: one entry per denomination unit plus at most one
    /// fractional residual entry. Rejects values below the smallest rung.
    pub fn absorb(
        &self,
        session: SessionId,
        currency: Currency,
        net_value: Amount,
        now: Timestamp,
    ) -> Result<Vec<PooledAmount>, MixError> {
        let ladder = self.ladder(currency)?;
        let (counts, residual) = ladder.split(net_value);
        if counts.is_empty() {
            return Err(MixError::AmountTooSmall {
                min: ladder.smallest(),
                got: net_value,
            });
        }

        let mut created = Vec::new();
        for (class, count) in counts {
            let rung = ladder.rung(class).expect("class from this ladder");
            for _ in 0..count {
                created.push(PooledAmount {
                    pool_entry_id: rng::pool_entry_id(),
                    currency,
                    amount: rung,
                    origin_session_id: session,
                    available_at: now,
                    denomination_class: class,
                    fractional: false,
                    state: PoolEntryState::Available,
                });
            }
        }
        if residual > 0 {
            created.push(PooledAmount {
                pool_entry_id: rng::pool_entry_id(),
                currency,
                amount: residual,
                origin_session_id: session,
                available_at: now,
                denomination_class: DenominationClass(0),
                fractional: true,
                state: PoolEntryState::Available,
            });
        }

        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");
        for entry in &created {
            self.store.put_pool_entry(entry)?;
            guard.entries.insert(entry.pool_entry_id, entry.clone());
        }
        debug!(
            session = %session,
            %currency,
            entries = created.len(),
            residual,
            "deposit absorbed into pool"
        );
        Ok(created)
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// Select and atomically reserve inventory covering `target` for
    /// `session`. Entries with the session's own origin are excluded;
    /// the selection must span at least `k_min` distinct origins.
    pub fn select(
        &self,
        currency: Currency,
        target: Amount,
        session: SessionId,
        k_min: usize,
        now: Timestamp,
    ) -> Result<Selection, MixError> {
        let ladder = self.ladder(currency)?;
        let (needed, residual) = ladder.split(target);
        if residual != 0 {
            // Targets are sums of rungs by construction; anything else is
            // a planner bug.
            return Err(MixError::Internal(format!(
                "selection target {target} is not a rung sum"
            )));
        }

        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");

        // Phase 1: choose, without mutating. Within a class, entries are
        // drawn round-robin across origins (origins ordered by their
        // oldest entry, entries within an origin oldest first): sojourn
        // time stays bounded and the selection spreads over as many
        // distinct origins as the inventory allows.
        let mut chosen: Vec<PoolEntryId> = Vec::new();
        for (class, count) in &needed {
            let mut by_origin: HashMap<SessionId, Vec<&PooledAmount>> = HashMap::new();
            for e in guard.entries.values().filter(|e| {
                e.denomination_class == *class
                    && e.origin_session_id != session
                    && e.is_available(now)
            }) {
                by_origin.entry(e.origin_session_id).or_default().push(e);
            }
            let mut queues: Vec<(Timestamp, Vec<&PooledAmount>)> = by_origin
                .into_values()
                .map(|mut entries| {
                    entries.sort_by_key(|e| e.available_at);
                    let oldest = entries[0].available_at;
                    entries.reverse(); // pop() yields oldest first
                    (oldest, entries)
                })
                .collect();
            queues.sort_by_key(|(oldest, _)| *oldest);

            let available: usize = queues.iter().map(|(_, q)| q.len()).sum();
            if (available as u64) < *count {
                let rung = ladder.rung(*class).expect("class from this ladder");
                return Err(MixError::InsufficientLiquidity {
                    currency,
                    need: rung * *count as Amount,
                    have: rung * available as Amount,
                });
            }
            let mut taken = 0u64;
            'outer: loop {
                let mut progressed = false;
                for (_, queue) in queues.iter_mut() {
                    if let Some(e) = queue.pop() {
                        chosen.push(e.pool_entry_id);
                        taken += 1;
                        progressed = true;
                        if taken == *count {
                            break 'outer;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        // Phase 2: the anonymity floor over the whole multiset.
        let origins: HashSet<SessionId> = chosen
            .iter()
            .filter_map(|id| guard.entries.get(id))
            .map(|e| e.origin_session_id)
            .collect();
        if origins.len() < k_min {
            return Err(MixError::InsufficientAnonymity {
                need: k_min,
                got: origins.len(),
            });
        }

        // Phase 3: reserve atomically under the shard writer.
        let lease_expires_at = now + self.lease_ttl;
        let mut reserved = Vec::with_capacity(chosen.len());
        for id in &chosen {
            let entry = guard.entries.get_mut(id).expect("chosen from this shard");
            entry.state = PoolEntryState::Reserved {
                session,
                lease_expires_at,
            };
            self.store.put_pool_entry(entry)?;
            reserved.push(entry.clone());
        }

        debug!(
            session = %session,
            %currency,
            entries = reserved.len(),
            origins = origins.len(),
            "selection reserved"
        );
        Ok(Selection {
            entries: reserved,
            distinct_origins: origins.len(),
        })
    }

    /// Take the session's own fractional residual (for the change output).
    pub fn take_fractional(
        &self,
        currency: Currency,
        session: SessionId,
        now: Timestamp,
    ) -> Result<Option<PooledAmount>, MixError> {
        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");
        let found = guard
            .entries
            .values()
            .find(|e| {
                e.fractional
                    && e.origin_session_id == session
                    && e.state == PoolEntryState::Available
            })
            .map(|e| e.pool_entry_id);
        let Some(id) = found else {
            return Ok(None);
        };
        let entry = guard.entries.get_mut(&id).expect("found above");
        entry.state = PoolEntryState::Reserved {
            session,
            lease_expires_at: now + self.lease_ttl,
        };
        self.store.put_pool_entry(entry)?;
        Ok(Some(entry.clone()))
    }

    // ── Reservation lifecycle ────────────────────────────────────────────────

    /// Release every reservation a session holds (scheduler failure or
    /// cancellation) back to Available.
    pub fn release_for_session(
        &self,
        currency: Currency,
        session: SessionId,
    ) -> Result<usize, MixError> {
        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");
        let mut released = 0;
        for entry in guard.entries.values_mut() {
            if entry.is_reserved_for(&session) {
                entry.state = PoolEntryState::Available;
                self.store.put_pool_entry(entry)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Mark reserved entries as spent once their funding broadcast is on
    /// the wire.
    pub fn consume(
        &self,
        currency: Currency,
        ids: &[PoolEntryId],
        now: Timestamp,
    ) -> Result<(), MixError> {
        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");
        for id in ids {
            let entry = guard
                .entries
                .get_mut(id)
                .ok_or_else(|| MixError::PoolEntryNotFound(id.to_hex()))?;
            entry.state = PoolEntryState::Spent { spent_at: now };
            self.store.put_pool_entry(entry)?;
        }
        Ok(())
    }

    /// Whether an origin already has inventory in the pool. Absorption
    /// guards on this so a replayed confirmation edge cannot double-count
    /// a deposit.
    pub fn origin_present(
        &self,
        currency: Currency,
        origin: SessionId,
    ) -> Result<bool, MixError> {
        let shard = self.shard(currency)?;
        let guard = shard.read().expect("pool shard lock");
        Ok(guard
            .entries
            .values()
            .any(|e| e.origin_session_id == origin))
    }

    /// Pull a reorged origin's inventory back out of the pool. Spent
    /// entries cannot be retracted; their count comes back so the caller
    /// can escalate.
    pub fn retract_origin(
        &self,
        currency: Currency,
        origin: SessionId,
    ) -> Result<(usize, usize), MixError> {
        let shard = self.shard(currency)?;
        let mut guard = shard.write().expect("pool shard lock");
        let ids: Vec<PoolEntryId> = guard
            .entries
            .values()
            .filter(|e| e.origin_session_id == origin)
            .map(|e| e.pool_entry_id)
            .collect();
        let mut removed = 0;
        let mut spent = 0;
        for id in ids {
            let entry = guard.entries.get(&id).expect("listed above");
            if matches!(entry.state, PoolEntryState::Spent { .. }) {
                spent += 1;
                continue;
            }
            guard.entries.remove(&id);
            self.store.remove_pool_entry(&id)?;
            removed += 1;
        }
        Ok((removed, spent))
    }

    /// Sweep expired leases back to Available. Returns how many reverted.
    pub fn expire_leases(&self, now: Timestamp) -> Result<usize, MixError> {
        let mut reverted = 0;
        for shard in self.shards.values() {
            let mut guard = shard.write().expect("pool shard lock");
            for entry in guard.entries.values_mut() {
                if entry.lease_expired(now) {
                    entry.state = PoolEntryState::Available;
                    self.store.put_pool_entry(entry)?;
                    reverted += 1;
                }
            }
        }
        if reverted > 0 {
            debug!(reverted, "expired leases returned to pool");
        }
        Ok(reverted)
    }

    // ── Views ────────────────────────────────────────────────────────────────

    pub fn available_value(&self, currency: Currency, now: Timestamp) -> Result<Amount, MixError> {
        let shard = self.shard(currency)?;
        let guard = shard.read().expect("pool shard lock");
        Ok(guard
            .entries
            .values()
            .filter(|e| e.is_available(now))
            .map(|e| e.amount)
            .sum())
    }

    /// Distinct non-self origins currently available at any class.
    pub fn distinct_origins(
        &self,
        currency: Currency,
        exclude: SessionId,
        now: Timestamp,
    ) -> Result<usize, MixError> {
        let shard = self.shard(currency)?;
        let guard = shard.read().expect("pool shard lock");
        let origins: HashSet<SessionId> = guard
            .entries
            .values()
            .filter(|e| e.is_available(now) && e.origin_session_id != exclude)
            .map(|e| e.origin_session_id)
            .collect();
        Ok(origins.len())
    }
}
