//! In-process observable counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared across the cache components.
///
/// Counters are plain atomics; reading them never takes a lock. Shipping them
/// to a metrics sink is the embedding application's concern.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) loader_invocations: AtomicU64,
    pub(crate) local_hits: AtomicU64,
    pub(crate) local_misses: AtomicU64,
    pub(crate) db_reads: AtomicU64,
    pub(crate) db_writes: AtomicU64,
    pub(crate) events_received: AtomicU64,
    pub(crate) events_discarded: AtomicU64,
    pub(crate) listener_reconnects: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            loader_invocations: self.loader_invocations.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            local_misses: self.local_misses.load(Ordering::Relaxed),
            db_reads: self.db_reads.load(Ordering::Relaxed),
            db_writes: self.db_writes.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            listener_reconnects: self.listener_reconnects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub loader_invocations: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub db_reads: u64,
    pub db_writes: u64,
    pub events_received: u64,
    pub events_discarded: u64,
    pub listener_reconnects: u64,
}
