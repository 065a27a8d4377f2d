//! Process-local cache tier.
//!
//! A sharded LRU mapping from key bytes to the last installed value. The
//! local tier is strictly an optimization: every operation stays correct
//! with `local_max_entries = 0`, where the store degrades to a no-op.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::Value;

use crate::stats::CacheStats;

const MAX_SHARDS: usize = 8;

/// How long a stale marker keeps blocking installs of superseded versions.
/// Long enough to outlive any in-flight load; short enough that markers do
/// not pin LRU capacity for keys nobody reads again.
const STALE_MARKER_TTL_SECS: i64 = 60;

/// A value held in the local tier.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub value: Value,
    pub version: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub inserted_at: Instant,
    /// Stale markers carry no value: they record that every version up to
    /// `version` has been superseded by an event, so a load that raced the
    /// event cannot re-install the old value. Lookups treat them as misses.
    stale: bool,
}

impl LocalEntry {
    pub fn new(value: Value, version: i64, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            version,
            expires_at,
            inserted_at: Instant::now(),
            stale: false,
        }
    }

    fn stale_marker(version: i64) -> Self {
        Self {
            value: Value::Null,
            version,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(STALE_MARKER_TTL_SECS)),
            inserted_at: Instant::now(),
            stale: true,
        }
    }

    /// Whether the entry has passed its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Capacity-bounded local store with LRU eviction and TTL-as-miss semantics.
///
/// Installs are version-monotonic: an entry never replaces one with an equal
/// or higher version, so late-arriving stale loads cannot roll a key back.
/// Every operation takes at most one shard lock.
pub struct LocalStore {
    shards: Vec<Mutex<LruCache<Vec<u8>, LocalEntry>>>,
    stats: Arc<CacheStats>,
}

impl LocalStore {
    /// Create a store with the given total capacity. Capacity 0 disables the
    /// local tier: every lookup misses and installs are dropped.
    pub fn new(capacity: usize, stats: Arc<CacheStats>) -> Self {
        let shards = if capacity == 0 {
            Vec::new()
        } else {
            let shard_count = capacity.min(MAX_SHARDS);
            let per_shard = capacity.div_ceil(shard_count);
            let per_shard = NonZeroUsize::new(per_shard).expect("per-shard capacity is non-zero");
            (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect()
        };
        Self { shards, stats }
    }

    pub fn is_enabled(&self) -> bool {
        !self.shards.is_empty()
    }

    fn shard(&self, key: &[u8]) -> &Mutex<LruCache<Vec<u8>, LocalEntry>> {
        // FNV-1a over the key bytes; stable and cheap for short keys.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// Fetch a fresh entry. Expired entries report as a miss and are dropped
    /// on observation; the reaper handles the ones nobody touches. Stale
    /// markers also report as misses but stay in place, so their version
    /// floor keeps guarding installs.
    pub fn lookup(&self, key: &[u8]) -> Option<LocalEntry> {
        if !self.is_enabled() {
            CacheStats::bump(&self.stats.local_misses);
            return None;
        }

        let now = Utc::now();
        let mut shard = self.shard(key).lock().expect("local store lock poisoned");
        match shard.get(key) {
            Some(entry) if entry.stale => {
                CacheStats::bump(&self.stats.local_misses);
                None
            }
            Some(entry) if !entry.is_expired(now) => {
                let entry = entry.clone();
                CacheStats::bump(&self.stats.local_hits);
                Some(entry)
            }
            Some(_) => {
                shard.pop(key);
                CacheStats::bump(&self.stats.local_misses);
                None
            }
            None => {
                CacheStats::bump(&self.stats.local_misses);
                None
            }
        }
    }

    /// Fetch an entry even past its expiry. Used by the stale-serving
    /// fallback; does not touch the hit/miss counters.
    pub fn lookup_stale(&self, key: &[u8]) -> Option<LocalEntry> {
        if !self.is_enabled() {
            return None;
        }
        let mut shard = self.shard(key).lock().expect("local store lock poisoned");
        shard.get(key).filter(|entry| !entry.stale).cloned()
    }

    /// Install an entry, rejecting versions that do not advance the key.
    /// Returns whether the entry was stored.
    pub fn install(&self, key: &[u8], entry: LocalEntry) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut shard = self.shard(key).lock().expect("local store lock poisoned");
        if let Some(current) = shard.peek(key) {
            if entry.version <= current.version {
                return false;
            }
        }
        shard.put(key.to_vec(), entry);
        true
    }

    /// Remove a key unconditionally.
    pub fn invalidate(&self, key: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let mut shard = self.shard(key).lock().expect("local store lock poisoned");
        shard.pop(key);
    }

    /// Record that every version up to and including `barrier` has been
    /// superseded. A local entry at or below the barrier is replaced by a
    /// stale marker (which lookups treat as absent); a newer entry stays. The
    /// marker also blocks a racing load from installing a superseded version
    /// it read before the event arrived.
    pub fn mark_stale(&self, key: &[u8], barrier: i64) {
        if !self.is_enabled() {
            return;
        }
        let mut shard = self.shard(key).lock().expect("local store lock poisoned");
        if let Some(current) = shard.peek(key) {
            if current.version > barrier {
                return;
            }
        }
        shard.put(key.to_vec(), LocalEntry::stale_marker(barrier));
    }

    /// Drop every entry. Used by the listener resync after a connection gap.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("local store lock poisoned").clear();
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("local store lock poisoned");
            let expired: Vec<Vec<u8>> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                shard.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("local store lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn store(capacity: usize) -> LocalStore {
        LocalStore::new(capacity, Arc::new(CacheStats::new()))
    }

    fn entry(version: i64) -> LocalEntry {
        LocalEntry::new(json!({"v": version}), version, None)
    }

    #[test]
    fn install_then_lookup() {
        let store = store(16);
        assert!(store.install(b"k", entry(1)));
        let found = store.lookup(b"k").unwrap();
        assert_eq!(found.version, 1);
        assert_eq!(found.value, json!({"v": 1}));
    }

    #[test]
    fn install_is_version_monotonic() {
        let store = store(16);
        assert!(store.install(b"k", entry(5)));
        assert!(!store.install(b"k", entry(5)), "equal version rejected");
        assert!(!store.install(b"k", entry(3)), "older version rejected");
        assert!(store.install(b"k", entry(6)));
        assert_eq!(store.lookup(b"k").unwrap().version, 6);
    }

    #[test]
    fn expired_entries_are_misses() {
        let store = store(16);
        let expired = LocalEntry::new(json!(1), 1, Some(Utc::now() - ChronoDuration::seconds(1)));
        assert!(store.install(b"k", expired));
        assert!(store.lookup(b"k").is_none());
        // Observation dropped the entry.
        assert!(store.lookup_stale(b"k").is_none());
    }

    #[test]
    fn stale_lookup_survives_expiry() {
        let store = store(16);
        let expired = LocalEntry::new(json!(1), 1, Some(Utc::now() - ChronoDuration::seconds(1)));
        assert!(store.install(b"k", expired));
        assert!(store.lookup_stale(b"k").is_some());
    }

    #[test]
    fn mark_stale_keeps_newer_entries() {
        let store = store(16);
        store.install(b"k", entry(10));

        store.mark_stale(b"k", 9);
        assert!(store.lookup(b"k").is_some(), "newer entry stays");

        store.mark_stale(b"k", 10);
        assert!(store.lookup(b"k").is_none(), "superseded entry reports absent");
    }

    #[test]
    fn stale_marker_blocks_superseded_installs() {
        let store = store(16);

        // An event for version 6 arrives before the racing load installs the
        // version 5 it read earlier.
        store.mark_stale(b"k", 5);
        assert!(!store.install(b"k", entry(5)), "superseded install rejected");
        assert!(store.lookup(b"k").is_none());

        // The re-read of version 6 installs over the marker.
        assert!(store.install(b"k", entry(6)));
        assert_eq!(store.lookup(b"k").unwrap().version, 6);
    }

    #[test]
    fn stale_markers_are_not_served_as_stale_values() {
        let store = store(16);
        store.mark_stale(b"k", 3);
        assert!(store.lookup_stale(b"k").is_none());
    }

    #[test]
    fn purge_expired_removes_only_expired() {
        let store = store(16);
        store.install(b"live", entry(1));
        let expired = LocalEntry::new(json!(2), 2, Some(Utc::now() - ChronoDuration::seconds(1)));
        store.install(b"dead", expired);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.lookup(b"live").is_some());
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        // Single shard (capacity below the shard threshold) keeps LRU order
        // observable.
        let store = store(2);
        store.install(b"a", entry(1));
        store.install(b"b", entry(2));
        store.lookup(b"a");
        store.install(b"c", entry(3));
        assert!(store.len() <= 2);
    }

    #[test]
    fn zero_capacity_disables_the_tier() {
        let store = store(0);
        assert!(!store.is_enabled());
        assert!(!store.install(b"k", entry(1)));
        assert!(store.lookup(b"k").is_none());
        assert!(store.lookup_stale(b"k").is_none());
        store.invalidate(b"k");
        store.clear();
        assert_eq!(store.purge_expired(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_empties_every_shard() {
        let store = store(64);
        for i in 0..32u8 {
            store.install(&[i], entry(i64::from(i) + 1));
        }
        assert!(store.len() > 0);
        store.clear();
        assert!(store.is_empty());
    }
}
