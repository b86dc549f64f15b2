use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use obscura_core::types::Timestamp;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bounded::Maintainable;

// ── TimerRegistry ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Interval,
    Oneshot,
}

struct TimerEntry {
    handle: JoinHandle<()>,
    kind: TimerKind,
    created_at: Timestamp,
    description: String,
}

/// Process-wide registry of long-lived timer tasks. Registration is the
/// rule: an unregistered periodic task cannot be cleared on shutdown and
/// is therefore a leak.
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<HashMap<String, TimerEntry>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawned task under `name`, replacing (and aborting) any
    /// previous task with the same name.
    pub fn register(
        &self,
        name: &str,
        kind: TimerKind,
        description: &str,
        handle: JoinHandle<()>,
    ) {
        let entry = TimerEntry {
            handle,
            kind,
            created_at: chrono::Utc::now().timestamp(),
            description: description.to_string(),
        };
        let mut timers = self.timers.lock().expect("timer registry lock");
        if let Some(previous) = timers.insert(name.to_string(), entry) {
            previous.handle.abort();
            debug!(name, "replaced existing timer");
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        let mut timers = self.timers.lock().expect("timer registry lock");
        match timers.remove(name) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name, kind, age, and description of every registered timer.
    pub fn describe(&self) -> Vec<(String, TimerKind, Timestamp, String)> {
        let timers = self.timers.lock().expect("timer registry lock");
        timers
            .iter()
            .map(|(name, e)| (name.clone(), e.kind, e.created_at, e.description.clone()))
            .collect()
    }

    /// Abort and drop every timer.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().expect("timer registry lock");
        for (name, entry) in timers.drain() {
            entry.handle.abort();
            debug!(name, "timer cancelled on shutdown");
        }
        info!("timer registry cleared");
    }
}

// ── CollectionRegistry ───────────────────────────────────────────────────────

/// Registry of every bounded collection in the process. The memory monitor
/// walks this on pressure; shutdown clears every collection. Registrations
/// are weak handles — the owner's lifecycle decides when a collection
/// dies, and dead handles are pruned on the next access.
#[derive(Default)]
pub struct CollectionRegistry {
    collections: Mutex<HashMap<String, Weak<dyn Maintainable>>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collection: Arc<dyn Maintainable>) {
        let name = collection.name();
        self.collections
            .lock()
            .expect("collection registry lock")
            .insert(name, Arc::downgrade(&collection));
    }

    /// Live registrations.
    pub fn len(&self) -> usize {
        let mut collections = self.collections.lock().expect("collection registry lock");
        collections.retain(|_, weak| weak.strong_count() > 0);
        collections.len()
    }

    /// Total entries across every live registered collection.
    pub fn total_entries(&self) -> usize {
        let mut collections = self.collections.lock().expect("collection registry lock");
        let mut total = 0;
        collections.retain(|_, weak| match weak.upgrade() {
            Some(m) => {
                total += m.len();
                true
            }
            None => false,
        });
        total
    }

    pub fn cleanup_all(&self) -> usize {
        let mut collections = self.collections.lock().expect("collection registry lock");
        let mut cleaned = 0;
        collections.retain(|name, weak| match weak.upgrade() {
            Some(m) => {
                cleaned += m.cleanup();
                true
            }
            None => {
                debug!(name, "pruned dead collection registration");
                false
            }
        });
        cleaned
    }

    pub fn emergency_cleanup_all(&self) -> usize {
        let mut collections = self.collections.lock().expect("collection registry lock");
        let mut evicted = 0;
        collections.retain(|_, weak| match weak.upgrade() {
            Some(m) => {
                evicted += m.emergency_cleanup();
                true
            }
            None => false,
        });
        evicted
    }

    /// Clear every surviving collection and drop the registrations.
    pub fn shutdown(&self) {
        let mut collections = self.collections.lock().expect("collection registry lock");
        for (name, weak) in collections.iter() {
            if let Some(m) = weak.upgrade() {
                m.clear();
                debug!(name, "collection cleared on shutdown");
            }
        }
        collections.clear();
        info!("collection registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded::BoundedCollection;

    #[tokio::test]
    async fn shutdown_empties_timer_registry() {
        let registry = TimerRegistry::new();
        for i in 0..3 {
            let handle = tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            });
            registry.register(&format!("t{i}"), TimerKind::Interval, "test timer", handle);
        }
        assert_eq!(registry.len(), 3);
        registry.shutdown();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn replacing_a_timer_aborts_the_old_one() {
        let registry = TimerRegistry::new();
        let first = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        registry.register("probe", TimerKind::Interval, "first", first);
        let second = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        registry.register("probe", TimerKind::Interval, "second", second);
        assert_eq!(registry.len(), 1);
        registry.shutdown();
    }

    #[test]
    fn dead_registrations_are_pruned() {
        let registry = CollectionRegistry::new();
        let shared: Arc<Mutex<BoundedCollection<u32, u32>>> =
            Arc::new(Mutex::new(BoundedCollection::new("gone", 4, 4, None)));
        registry.register(shared.clone());
        assert_eq!(registry.len(), 1);

        // The registry must not keep the collection alive on its own.
        drop(shared);
        assert_eq!(registry.cleanup_all(), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn shutdown_clears_all_collections() {
        let registry = CollectionRegistry::new();
        let shared: Arc<Mutex<BoundedCollection<u32, u32>>> =
            Arc::new(Mutex::new(BoundedCollection::new("s", 10, 10, None)));
        shared.lock().unwrap().insert(1, 1, 0);
        shared.lock().unwrap().insert(2, 2, 0);
        registry.register(shared.clone());
        assert_eq!(registry.total_entries(), 2);
        registry.shutdown();
        assert_eq!(shared.lock().unwrap().len(), 0);
        assert_eq!(registry.len(), 0);
    }
}
