use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use obscura_core::constants::{EMERGENCY_EVICT_DEN, EMERGENCY_EVICT_NUM};
use obscura_core::types::Timestamp;
use tracing::debug;

// ── Entry bookkeeping ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    created_at: Timestamp,
    last_accessed: Timestamp,
    access_count: u64,
}

// ── BoundedCollection ────────────────────────────────────────────────────────

/// Associative container with a hard size cap, LRU eviction, optional TTL,
/// and per-entry access bookkeeping. `size ≤ max_size` holds after every
/// operation.
///
/// All mutating calls take `now` explicitly so behavior is testable without
/// a clock.
#[derive(Debug)]
pub struct BoundedCollection<K, V> {
    name: String,
    max_size: usize,
    /// `cleanup` trims down to this many entries after TTL expiry.
    cleanup_threshold: usize,
    ttl_secs: Option<i64>,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> BoundedCollection<K, V> {
    pub fn new(name: &str, max_size: usize, cleanup_threshold: usize, ttl_secs: Option<i64>) -> Self {
        assert!(max_size > 0, "max_size must be positive");
        Self {
            name: name.to_string(),
            max_size,
            cleanup_threshold: cleanup_threshold.min(max_size),
            ttl_secs,
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert, evicting the least-recently-used entry first if at capacity.
    pub fn insert(&mut self, key: K, value: V, now: Timestamp) -> Option<V> {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru(1);
        }
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    created_at: now,
                    last_accessed: now,
                    access_count: 0,
                },
            )
            .map(|e| e.value)
    }

    /// Read access: touches `last_accessed` and the access counter.
    pub fn get(&mut self, key: &K, now: Timestamp) -> Option<&V> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(&entry.value)
    }

    /// Non-touching read, for inspection paths.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    /// Regular cleanup pass: drop TTL-expired entries, then trim LRU down
    /// to the cleanup threshold. Returns how many entries were removed.
    pub fn cleanup(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        if let Some(ttl) = self.ttl_secs {
            self.entries.retain(|_, e| now - e.created_at < ttl);
        }
        if self.entries.len() > self.cleanup_threshold {
            let excess = self.entries.len() - self.cleanup_threshold;
            self.evict_lru(excess);
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(collection = %self.name, removed, "cleanup pass");
        }
        removed
    }

    /// Emergency pass: evict at least half the entries, coldest first.
    pub fn emergency_cleanup(&mut self) -> usize {
        let target = (self.entries.len() * EMERGENCY_EVICT_NUM).div_ceil(EMERGENCY_EVICT_DEN);
        self.evict_lru(target);
        target
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let mut by_age: Vec<(K, Timestamp)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
        }
    }
}

// ── Registry seam ────────────────────────────────────────────────────────────

/// What the governor needs from any registered collection, independent of
/// its key/value types.
pub trait Maintainable: Send + Sync {
    fn name(&self) -> String;
    fn len(&self) -> usize;
    fn cleanup(&self) -> usize;
    fn emergency_cleanup(&self) -> usize;
    fn clear(&self);
}

/// Shared handle: what components hold, and what gets registered.
pub type SharedBounded<K, V> = Arc<Mutex<BoundedCollection<K, V>>>;

impl<K: Eq + Hash + Clone + Send, V: Send> Maintainable for Mutex<BoundedCollection<K, V>> {
    fn name(&self) -> String {
        self.lock().map(|c| c.name().to_string()).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cleanup(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        self.lock().map(|mut c| c.cleanup(now)).unwrap_or(0)
    }

    fn emergency_cleanup(&self) -> usize {
        self.lock().map(|mut c| c.emergency_cleanup()).unwrap_or(0)
    }

    fn clear(&self) {
        if let Ok(mut c) = self.lock() {
            c.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_cap_holds_after_every_insert() {
        let mut c = BoundedCollection::new("caps", 3, 3, None);
        for i in 0..10 {
            c.insert(i, i * 10, i as i64);
            assert!(c.len() <= 3);
        }
    }

    #[test]
    fn lru_evicts_coldest() {
        let mut c = BoundedCollection::new("lru", 2, 2, None);
        c.insert("a", 1, 0);
        c.insert("b", 2, 1);
        // Touch "a" so "b" becomes coldest.
        c.get(&"a", 5);
        c.insert("c", 3, 6);
        assert!(c.contains(&"a"));
        assert!(!c.contains(&"b"));
        assert!(c.contains(&"c"));
    }

    #[test]
    fn ttl_expiry_on_cleanup() {
        let mut c = BoundedCollection::new("ttl", 10, 10, Some(100));
        c.insert("old", 1, 0);
        c.insert("new", 2, 90);
        let removed = c.cleanup(120);
        assert_eq!(removed, 1);
        assert!(!c.contains(&"old"));
        assert!(c.contains(&"new"));
    }

    #[test]
    fn cleanup_trims_to_threshold() {
        let mut c = BoundedCollection::new("trim", 10, 4, None);
        for i in 0..8 {
            c.insert(i, i, i as i64);
        }
        c.cleanup(100);
        assert_eq!(c.len(), 4);
        // The four most recently touched survive.
        for i in 4..8 {
            assert!(c.contains(&i));
        }
    }

    #[test]
    fn emergency_evicts_at_least_half() {
        let mut c = BoundedCollection::new("panic", 10, 10, None);
        for i in 0..7 {
            c.insert(i, i, i as i64);
        }
        c.emergency_cleanup();
        assert!(c.len() <= 3);
    }

    #[test]
    fn access_counts_tracked() {
        let mut c = BoundedCollection::new("counts", 4, 4, None);
        c.insert("k", 7, 0);
        c.get(&"k", 1);
        c.get(&"k", 2);
        assert_eq!(c.entries.get(&"k").unwrap().access_count, 2);
        assert_eq!(c.entries.get(&"k").unwrap().last_accessed, 2);
    }
}
