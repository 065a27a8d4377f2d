//! Per-key coordination of concurrent loads and writes.
//!
//! For each key missing from the local tier, at most one loader runs per
//! process; overlapping callers wait on an in-flight ticket and share the
//! leader's outcome. Failures fan out to every waiter and are never cached.
//! If the leader's future is dropped mid-load, one waiter promotes itself
//! and re-invokes its own loader; a ticket with no leader and no waiters is
//! destroyed.
//!
//! Shard locks are plain mutexes and are never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;

const SHARD_COUNT: usize = 16;

/// Outcome shared between the leader and its waiters: the loaded value and
/// the version it was cached under, or `None` when the loader declined to
/// produce a cacheable value.
pub(crate) type FlightResult = Result<Option<(Value, i64)>>;

enum Phase {
    /// A leader is driving the load.
    Running,
    /// The leader's future was dropped before completing; the next waiter to
    /// observe this takes over.
    Abandoned,
    /// Finished; every waiter receives a clone.
    Done(FlightResult),
}

struct TicketInner {
    phase: Phase,
    waiters: usize,
}

struct Ticket {
    inner: Mutex<TicketInner>,
    notify: Notify,
}

impl Ticket {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TicketInner {
                phase: Phase::Running,
                waiters: 0,
            }),
            notify: Notify::new(),
        }
    }
}

/// Sharded map of in-flight tickets keyed by cache key.
pub(crate) struct FlightGroup {
    shards: Vec<Mutex<HashMap<Vec<u8>, Arc<Ticket>>>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<HashMap<Vec<u8>, Arc<Ticket>>> {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash as usize) % SHARD_COUNT]
    }

    /// Run `work` under single-flight coordination for `key`.
    ///
    /// The first caller becomes leader and runs its own `work`; concurrent
    /// callers for the same key wait and share the leader's result. A waiter
    /// promoted after leader abandonment runs its own `work` instead.
    pub async fn execute<F, Fut>(&self, key: &[u8], work: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        let (ticket, is_leader) = self.join(key);

        if is_leader {
            return self.lead(key, &ticket, work).await;
        }

        match self.wait(key, &ticket).await {
            WaitOutcome::Done(result) => result,
            WaitOutcome::Promoted => {
                debug!("promoted to loader after initiator abandoned the key");
                self.lead(key, &ticket, work).await
            }
        }
    }

    /// Number of keys currently coordinated.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no tickets remain, up to `deadline`. Used by `close()` to
    /// drain gracefully; returns whether the group emptied in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
    }

    fn join(&self, key: &[u8]) -> (Arc<Ticket>, bool) {
        let mut shard = self.shard(key).lock().expect("flight shard lock poisoned");
        if let Some(ticket) = shard.get(key) {
            let ticket = Arc::clone(ticket);
            ticket.inner.lock().expect("ticket lock poisoned").waiters += 1;
            (ticket, false)
        } else {
            let ticket = Arc::new(Ticket::new());
            shard.insert(key.to_vec(), Arc::clone(&ticket));
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            (ticket, true)
        }
    }

    async fn lead<F, Fut>(&self, key: &[u8], ticket: &Arc<Ticket>, work: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        let mut guard = AbandonGuard {
            group: self,
            key,
            ticket,
            armed: true,
        };

        let result = work().await;
        guard.armed = false;

        self.complete(key, ticket, result.clone());
        result
    }

    /// Publish the result and destroy the ticket. New callers for the key
    /// start a fresh flight; existing waiters hold the ticket through its Arc.
    fn complete(&self, key: &[u8], ticket: &Arc<Ticket>, result: FlightResult) {
        self.remove(key, ticket);
        let mut inner = ticket.inner.lock().expect("ticket lock poisoned");
        inner.phase = Phase::Done(result);
        drop(inner);
        ticket.notify.notify_waiters();
    }

    fn remove(&self, key: &[u8], ticket: &Arc<Ticket>) {
        let mut shard = self.shard(key).lock().expect("flight shard lock poisoned");
        self.remove_from(&mut shard, key, ticket);
    }

    /// Remove the exact ticket from an already-locked shard. A promoted
    /// flight may have been replaced by a newer ticket for the same key, so
    /// anything but a pointer match is left alone.
    fn remove_from(
        &self,
        shard: &mut HashMap<Vec<u8>, Arc<Ticket>>,
        key: &[u8],
        ticket: &Arc<Ticket>,
    ) {
        if let Some(current) = shard.get(key) {
            if Arc::ptr_eq(current, ticket) {
                shard.remove(key);
                if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.idle.notify_waiters();
                }
            }
        }
    }

    async fn wait(&self, key: &[u8], ticket: &Arc<Ticket>) -> WaitOutcome {
        let mut waiter = WaiterGuard {
            group: self,
            key,
            ticket,
            armed: true,
        };

        loop {
            let notified = ticket.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = ticket.inner.lock().expect("ticket lock poisoned");
                match &inner.phase {
                    Phase::Done(result) => {
                        let result = result.clone();
                        inner.waiters -= 1;
                        waiter.armed = false;
                        return WaitOutcome::Done(result);
                    }
                    Phase::Abandoned => {
                        inner.phase = Phase::Running;
                        inner.waiters -= 1;
                        waiter.armed = false;
                        return WaitOutcome::Promoted;
                    }
                    Phase::Running => {}
                }
            }

            notified.await;
        }
    }
}

enum WaitOutcome {
    Done(FlightResult),
    Promoted,
}

/// Marks the ticket abandoned if the leader's future is dropped before
/// completion, waking a waiter to take over. With no waiters left the ticket
/// is destroyed outright.
struct AbandonGuard<'a> {
    group: &'a FlightGroup,
    key: &'a [u8],
    ticket: &'a Arc<Ticket>,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Hold the shard lock across the whole decision: a joiner needs it
        // too, so the waiter count cannot change between the check and the
        // removal.
        let mut shard = self
            .group
            .shard(self.key)
            .lock()
            .expect("flight shard lock poisoned");
        let waiters = {
            let mut inner = self.ticket.inner.lock().expect("ticket lock poisoned");
            inner.phase = Phase::Abandoned;
            inner.waiters
        };
        if waiters == 0 {
            self.group.remove_from(&mut shard, self.key, self.ticket);
        } else {
            self.ticket.notify.notify_waiters();
        }
    }
}

/// Keeps the waiter count accurate when a waiting future is dropped; the
/// last waiter leaving an abandoned ticket destroys it.
struct WaiterGuard<'a> {
    group: &'a FlightGroup,
    key: &'a [u8],
    ticket: &'a Arc<Ticket>,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shard = self
            .group
            .shard(self.key)
            .lock()
            .expect("flight shard lock poisoned");
        let orphaned = {
            let mut inner = self.ticket.inner.lock().expect("ticket lock poisoned");
            inner.waiters -= 1;
            inner.waiters == 0 && matches!(inner.phase, Phase::Abandoned)
        };
        if orphaned {
            self.group.remove_from(&mut shard, self.key, self.ticket);
        }
    }
}

/// Per-key async locks serializing same-process writes so upserts for one
/// key never overlap within a process.
pub(crate) struct KeyLocks {
    shards: Vec<Mutex<HashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<HashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>> {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash as usize) % SHARD_COUNT]
    }

    /// Acquire the write lock for a key.
    pub async fn acquire(&self, key: &[u8]) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut shard = self.shard(key).lock().expect("key lock shard poisoned");
            Arc::clone(
                shard
                    .entry(key.to_vec())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the map entry once nobody holds or awaits the lock.
    pub fn release(&self, key: &[u8]) {
        let mut shard = self.shard(key).lock().expect("key lock shard poisoned");
        let unused = matches!(shard.get(key), Some(lock) if Arc::strong_count(lock) == 1);
        if unused {
            shard.remove(key);
        }
    }
}
