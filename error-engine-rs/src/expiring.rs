//! # Expiring Keyed Map
//!
//! The single storage primitive behind every keyed cache in the engine
//! (rate-limit windows, circuit breakers, correlation windows, the duplicate
//! cache and aggregation counters). Entries remember when they were last
//! touched and are evicted by explicit sweeps once idle past the TTL.
//!
//! Contents are never a source of truth: losing an entry only degrades
//! throttling or grouping quality.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    touched: Instant,
}

/// A map whose entries expire after a period of inactivity
#[derive(Debug)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, Slot<V>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
    /// Creates an empty map evicting entries idle for longer than `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Inserts or replaces an entry, marking it freshly touched
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries
            .insert(key, Slot { value, touched: Instant::now() })
            .map(|slot| slot.value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Mutable access without refreshing the entry's idle clock
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Returns the entry for `key`, creating it with `make` if absent,
    /// and marks it touched
    pub fn get_or_insert_with<F>(&mut self, key: K, make: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let slot = self.entries.entry(key).or_insert_with(|| Slot {
            value: make(),
            touched: Instant::now(),
        });
        slot.touched = Instant::now();
        &mut slot.value
    }

    /// Refreshes the idle clock of an entry; returns false if absent
    pub fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Time since the entry was last touched
    pub fn idle_for<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|slot| slot.touched.elapsed())
    }

    /// True if the entry exists and has been idle longer than the TTL
    pub fn is_expired<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.idle_for(key).map_or(false, |idle| idle > self.ttl)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|slot| slot.value)
    }

    /// Evicts every entry idle past the TTL, returning how many were dropped
    pub fn sweep(&mut self) -> usize {
        self.sweep_where(|_| true)
    }

    /// Evicts entries idle past the TTL for which `evictable` holds
    pub fn sweep_where<F>(&mut self, mut evictable: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.touched.elapsed() <= ttl || !evictable(&slot.value));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_entries() {
        let mut map = ExpiringMap::new(Duration::from_secs(10));
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(map.touch("b"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(map.is_expired("a"));
        assert!(!map.is_expired("b"));

        assert_eq!(map.sweep(), 1);
        assert!(map.get("a").is_none());
        assert_eq!(map.get("b"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_where_keeps_protected_entries() {
        let mut map = ExpiringMap::new(Duration::from_secs(1));
        map.insert("keep", true);
        map.insert("drop", false);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(map.sweep_where(|pinned| !*pinned), 1);
        assert_eq!(map.len(), 1);
        assert!(map.get("keep").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_insert_touches() {
        let mut map = ExpiringMap::new(Duration::from_secs(5));
        *map.get_or_insert_with("k", || 0) += 1;

        tokio::time::advance(Duration::from_secs(4)).await;
        *map.get_or_insert_with("k", || 0) += 1;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.get("k"), Some(&2));
    }
}
