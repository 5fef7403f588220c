//! Expiring key/value cache.
//!
//! Holds short-lived live data (seen-before markers, antenna statistics, scale
//! readings, agent heartbeats). Entries expire lazily: reads ignore stale
//! values and `purge_expired` drops them.

use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use rfidgate_core::Timestamp;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Timestamp,
}

/// Concurrent map whose entries carry their own expiry.
#[derive(Debug, Clone)]
pub struct ExpiringMap<V> {
    entries: Arc<DashMap<String, Entry<V>>>,
}

impl<V> Default for ExpiringMap<V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<V: Clone> ExpiringMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl_secs: u64, now: Timestamp) {
        let expires_at = now + chrono::Duration::seconds(ttl_secs as i64);
        self.entries
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Value for `key` if it has not expired.
    pub fn get(&self, key: &str, now: Timestamp) -> Option<V> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Insert `key` unless a live entry exists. Returns true when the key was
    /// already live.
    pub fn check_and_mark(
        &self,
        key: impl Into<String>,
        value: V,
        ttl_secs: u64,
        now: Timestamp,
    ) -> bool {
        let mut seen = false;
        self.upsert_with(key, ttl_secs, now, |live| match live {
            Some(existing) => {
                seen = true;
                existing
            }
            None => value,
        });
        seen
    }

    /// Read-modify-write a single entry under its shard lock. `update`
    /// receives the live value, if any, and returns the new one. The expiry is
    /// pushed out to `now + ttl_secs`.
    pub fn upsert_with<F>(&self, key: impl Into<String>, ttl_secs: u64, now: Timestamp, update: F) -> V
    where
        F: FnOnce(Option<V>) -> V,
    {
        let expires_at = now + chrono::Duration::seconds(ttl_secs as i64);
        match self.entries.entry(key.into()) {
            Slot::Occupied(mut occupied) => {
                let live = if occupied.get().expires_at > now {
                    Some(occupied.get().value.clone())
                } else {
                    None
                };
                let next = update(live);
                occupied.insert(Entry {
                    value: next.clone(),
                    expires_at,
                });
                next
            }
            Slot::Vacant(vacant) => {
                let next = update(None);
                vacant.insert(Entry {
                    value: next.clone(),
                    expires_at,
                });
                next
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Live entries as (key, value) pairs.
    pub fn live_entries(&self, now: Timestamp) -> Vec<(String, V)> {
        self.entries
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_entries_expire() {
        let map = ExpiringMap::new();
        map.insert("a", 1, 10, t0());
        assert_eq!(map.get("a", t0() + Duration::seconds(9)), Some(1));
        assert_eq!(map.get("a", t0() + Duration::seconds(10)), None);
        assert_eq!(map.purge_expired(t0() + Duration::seconds(11)), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_check_and_mark() {
        let map = ExpiringMap::new();
        assert!(!map.check_and_mark("dev:1:AA", (), 60, t0()));
        assert!(map.check_and_mark("dev:1:AA", (), 60, t0() + Duration::seconds(30)));
        assert!(!map.check_and_mark("dev:1:AA", (), 60, t0() + Duration::seconds(200)));
    }

    #[test]
    fn test_upsert_with_sees_only_live_values() {
        let map = ExpiringMap::new();
        assert_eq!(map.upsert_with("k", 5, t0(), |v| v.unwrap_or(0) + 1), 1);
        assert_eq!(map.upsert_with("k", 5, t0(), |v| v.unwrap_or(0) + 1), 2);
        let later = t0() + Duration::seconds(60);
        assert_eq!(map.upsert_with("k", 5, later, |v| v.unwrap_or(0) + 1), 1);
    }
}
