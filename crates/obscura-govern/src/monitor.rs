use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use obscura_core::config::ResourceConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::{CollectionRegistry, TimerKind, TimerRegistry};

// ── GovernorEvent ────────────────────────────────────────────────────────────

/// Emitted by the memory monitor. Consumed by the alert core and by
/// anything that wants the raw usage samples.
#[derive(Clone, Debug, PartialEq)]
pub enum GovernorEvent {
    MemoryUsage { bytes: u64, ratio: f64 },
    MemoryWarning { ratio: f64, cleaned: usize },
    MemoryCritical { ratio: f64, evicted: usize },
}

// ── ResourceGovernor ─────────────────────────────────────────────────────────

/// Owns the two process-wide registries and the memory monitor. Created at
/// startup as part of the core context; dropping it (after `shutdown`) is
/// the end of the core's resource lifetime.
pub struct ResourceGovernor {
    pub timers: TimerRegistry,
    pub collections: CollectionRegistry,
    config: ResourceConfig,
    under_pressure: AtomicBool,
}

impl ResourceGovernor {
    pub fn new(config: ResourceConfig) -> Arc<Self> {
        Arc::new(Self {
            timers: TimerRegistry::new(),
            collections: CollectionRegistry::new(),
            config,
            under_pressure: AtomicBool::new(false),
        })
    }

    /// Global backpressure signal: true between a warning sample and the
    /// next healthy one. Session queues consult this before accepting
    /// new work.
    pub fn is_under_pressure(&self) -> bool {
        self.under_pressure.load(Ordering::Relaxed)
    }

    /// Current process physical memory, if the platform exposes it.
    pub fn memory_bytes() -> Option<u64> {
        memory_stats::memory_stats().map(|s| s.physical_mem as u64)
    }

    /// Start the sampling loop. Registers itself in the timer registry so
    /// shutdown clears it with everything else.
    pub fn spawn_monitor(self: &Arc<Self>, events: mpsc::Sender<GovernorEvent>) {
        let governor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.monitor_interval_s.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                governor.sample(&events).await;
            }
        });
        self.timers.register(
            "memory-monitor",
            TimerKind::Interval,
            "memory usage sampling and pressure response",
            handle,
        );
    }

    async fn sample(&self, events: &mpsc::Sender<GovernorEvent>) {
        let Some(bytes) = Self::memory_bytes() else {
            return;
        };
        let ratio = bytes as f64 / self.config.memory_budget_bytes.max(1) as f64;
        let _ = events
            .send(GovernorEvent::MemoryUsage { bytes, ratio })
            .await;

        if ratio > self.config.heap_critical {
            let evicted = self.collections.emergency_cleanup_all();
            self.under_pressure.store(true, Ordering::Relaxed);
            warn!(ratio, evicted, "memory critical — emergency cleanup");
            let _ = events
                .send(GovernorEvent::MemoryCritical { ratio, evicted })
                .await;
        } else if ratio > self.config.heap_warning {
            let cleaned = self.collections.cleanup_all();
            self.under_pressure.store(true, Ordering::Relaxed);
            warn!(ratio, cleaned, "memory warning — cleanup pass");
            let _ = events
                .send(GovernorEvent::MemoryWarning { ratio, cleaned })
                .await;
        } else {
            self.under_pressure.store(false, Ordering::Relaxed);
        }
    }

    /// Tear down: cancel every timer, clear every collection, drop
    /// registrations. After this both registries report empty.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.collections.shutdown();
        info!("resource governor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded::BoundedCollection;
    use std::sync::Mutex;

    fn governor(budget: u64) -> Arc<ResourceGovernor> {
        ResourceGovernor::new(ResourceConfig {
            heap_warning: 0.8,
            heap_critical: 0.9,
            monitor_interval_s: 1,
            memory_budget_bytes: budget,
        })
    }

    #[tokio::test]
    async fn critical_sample_triggers_emergency_cleanup() {
        // A 1-byte budget forces the critical branch on any real process.
        let governor = governor(1);
        let shared: Arc<Mutex<BoundedCollection<u32, u32>>> =
            Arc::new(Mutex::new(BoundedCollection::new("m", 100, 100, None)));
        for i in 0..10 {
            shared.lock().unwrap().insert(i, i, i as i64);
        }
        governor.collections.register(shared.clone());

        let (tx, mut rx) = mpsc::channel(8);
        governor.sample(&tx).await;

        // First event is always the usage sample.
        assert!(matches!(
            rx.recv().await,
            Some(GovernorEvent::MemoryUsage { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(GovernorEvent::MemoryCritical { .. })
        ));
        assert!(shared.lock().unwrap().len() <= 5);
        assert!(governor.is_under_pressure());
    }

    #[tokio::test]
    async fn healthy_sample_clears_pressure() {
        // An absurdly large budget keeps the ratio near zero.
        let governor = governor(u64::MAX);
        let (tx, mut rx) = mpsc::channel(8);
        governor.sample(&tx).await;
        assert!(matches!(
            rx.recv().await,
            Some(GovernorEvent::MemoryUsage { .. })
        ));
        assert!(!governor.is_under_pressure());
    }

    #[tokio::test]
    async fn shutdown_empties_both_registries() {
        let governor = governor(u64::MAX);
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        governor
            .timers
            .register("t", TimerKind::Oneshot, "test", handle);
        let shared: Arc<Mutex<BoundedCollection<u8, u8>>> =
            Arc::new(Mutex::new(BoundedCollection::new("c", 4, 4, None)));
        shared.lock().unwrap().insert(1, 1, 0);
        governor.collections.register(shared.clone());

        governor.shutdown();
        assert!(governor.timers.is_empty());
        assert_eq!(governor.collections.len(), 0);
        assert_eq!(shared.lock().unwrap().len(), 0);
    }
}
