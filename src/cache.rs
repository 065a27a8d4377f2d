//! Public cache client.
//!
//! `PostgresCache` orchestrates the local tier, the single-flight
//! coordinator, the database gateway and the notification listener. The
//! database row is always the authoritative value; the local tier is an
//! optimization that every operation survives without.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::codec::{JsonCodec, ValueCodec};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventOp};
use crate::flight::{FlightGroup, KeyLocks};
use crate::gateway::Gateway;
use crate::listener::{CacheEventHandler, CacheListener};
use crate::schema::{SchemaManager, SchemaNames};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::store::{LocalEntry, LocalStore};

/// Keys are opaque byte strings with a bounded length.
const MAX_KEY_BYTES: usize = 512;

/// Deadline for draining in-flight loads during `close()`.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Distributed read-through cache client backed by PostgreSQL.
///
/// Cloning is cheap and shares the underlying pool, local tier and listener.
#[derive(Clone)]
pub struct PostgresCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    names: SchemaNames,
    codec: Arc<dyn ValueCodec>,
    pool: PgPool,
    gateway: Gateway,
    store: Arc<LocalStore>,
    flight: FlightGroup,
    write_locks: KeyLocks,
    stats: Arc<CacheStats>,
    closed: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

/// Applies decoded events to the local store.
///
/// An upsert event marks every version below the event's as superseded: an
/// older local entry stops being served and a racing load cannot re-install
/// the version it read before the event. A delete event additionally retires
/// the event's own version, since that exact value is gone. After a
/// connection gap the whole tier is invalidated, because missed events cannot
/// be replayed.
struct StoreEventHandler {
    store: Arc<LocalStore>,
    stats: Arc<CacheStats>,
}

#[async_trait]
impl CacheEventHandler for StoreEventHandler {
    async fn handle_event(&self, event: CacheEvent) {
        let key = match event.key_bytes() {
            Ok(key) => key,
            Err(error) => {
                CacheStats::bump(&self.stats.events_discarded);
                warn!(%error, "discarding event with undecodable key");
                return;
            }
        };
        match event.op {
            EventOp::Upsert => self.store.mark_stale(&key, event.version.saturating_sub(1)),
            EventOp::Delete => self.store.mark_stale(&key, event.version),
        }
    }

    async fn handle_resync(&self) {
        self.store.clear();
    }
}

fn validate_key(key: &str) -> Result<&[u8]> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(CacheError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_BYTES}",
            key.len()
        )));
    }
    Ok(key.as_bytes())
}

fn decode_typed<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| CacheError::encoding(format!("cached value does not match requested type: {e}")))
}

/// Client-side estimate of the expiry instant for a freshly written entry.
/// The authoritative instant is assigned server-side; a small clock skew only
/// shifts when the local tier stops serving, never what the backend returns.
fn local_expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d)
}

impl PostgresCache {
    /// Idempotently create the schema objects for `config`'s prefix without
    /// constructing a client. Useful for deploy-time migration steps.
    pub async fn init_db(config: &CacheConfig) -> Result<()> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&config.dsn)
            .await?;
        let result = SchemaManager::ensure(&pool, config).await;
        pool.close().await;
        result
    }

    /// Connect with the default codec.
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        Self::connect_with_codec(config, Arc::new(JsonCodec)).await
    }

    /// Connect with a caller-supplied value codec.
    pub async fn connect_with_codec(
        config: CacheConfig,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.dsn)
            .await?;
        Self::build(pool, config, codec).await
    }

    /// Build a client over an existing pool (bring your own pool). The
    /// listener still opens its own dedicated connection from `config.dsn`.
    pub async fn with_pool(pool: PgPool, config: CacheConfig) -> Result<Self> {
        Self::with_pool_and_codec(pool, config, Arc::new(JsonCodec)).await
    }

    /// Build over an existing pool with a caller-supplied codec.
    pub async fn with_pool_and_codec(
        pool: PgPool,
        config: CacheConfig,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(pool, config, codec).await
    }

    async fn build(pool: PgPool, config: CacheConfig, codec: Arc<dyn ValueCodec>) -> Result<Self> {
        SchemaManager::ensure(&pool, &config).await?;

        let stats = Arc::new(CacheStats::new());
        let names = SchemaNames::resolve(&config.object_prefix);
        let store = Arc::new(LocalStore::new(config.local_max_entries, Arc::clone(&stats)));
        let gateway = Gateway::new(pool.clone(), &names, Arc::clone(&stats));

        let listener_task = if config.disable_notify {
            debug!("notifications disabled, relying on TTL for coherence");
            None
        } else {
            let handler = Arc::new(StoreEventHandler {
                store: Arc::clone(&store),
                stats: Arc::clone(&stats),
            });
            let listener = CacheListener::new(
                config.dsn.clone(),
                config.channel(),
                config.listener_reconnect_backoff,
                config.listener_reconnect_backoff_max,
                handler,
                Arc::clone(&stats),
            );
            Some(listener.spawn())
        };

        let reaper_task = Some(Self::spawn_reaper(
            Arc::clone(&store),
            gateway.clone(),
            config.reaper_interval,
            config.sweep_batch,
        ));

        info!(
            prefix = %config.object_prefix,
            channel = %config.channel(),
            local_max_entries = config.local_max_entries,
            notify = !config.disable_notify,
            "cache client connected"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                names,
                codec,
                pool,
                gateway,
                store,
                flight: FlightGroup::new(),
                write_locks: KeyLocks::new(),
                stats,
                closed: AtomicBool::new(false),
                listener_task: Mutex::new(listener_task),
                reaper_task: Mutex::new(reaper_task),
            }),
        })
    }

    fn spawn_reaper(
        store: Arc<LocalStore>,
        gateway: Gateway,
        interval: Duration,
        sweep_batch: u32,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged expired local entries");
                }
                if sweep_batch > 0 {
                    if let Err(error) = gateway.sweep_expired(sweep_batch).await {
                        debug!(%error, "expired-row sweep failed, will retry next tick");
                    }
                }
            }
        })
    }

    /// Read a value, consulting the local tier first.
    ///
    /// Returns `Ok(None)` for absent or expired keys. With
    /// `serve_stale_on_error` enabled, an unavailable backend falls back to a
    /// present (possibly expired) local entry.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.ensure_open()?;
        let key_bytes = validate_key(key)?;
        let value = self.with_deadline(self.read_value(key_bytes)).await?;
        value.map(decode_typed).transpose()
    }

    /// Read through the cache, invoking `loader` on a miss.
    ///
    /// At most one loader runs per key per process; concurrent callers share
    /// its outcome. A loader returning `Ok(None)` means "do not cache": the
    /// call returns `Ok(None)` and nothing is stored. Loader errors propagate
    /// to every current waiter and are never cached. Uses the configured
    /// default TTL.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        self.get_or_load_with_ttl(key, loader, self.inner.config.default_ttl)
            .await
    }

    /// [`get_or_load`](Self::get_or_load) with an explicit TTL
    /// (`None` = no expiry).
    #[instrument(skip(self, loader), fields(key = %key))]
    pub async fn get_or_load_with_ttl<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        self.ensure_open()?;
        let key_bytes = validate_key(key)?;
        let inner = &self.inner;

        let fut = async move {
            if let Some(entry) = inner.store.lookup(key_bytes) {
                return Ok(Some(entry.value));
            }

            let flight_result = inner
                .flight
                .execute(key_bytes, || self.load_flight(key_bytes, loader, ttl))
                .await?;
            Ok(flight_result.map(|(value, _version)| value))
        };

        let value: Option<Value> = self.with_deadline(fut).await?;
        value.map(decode_typed).transpose()
    }

    /// The initiator path of a read-through load: re-check the backend, then
    /// run the loader and publish its result.
    async fn load_flight<T, F, Fut>(
        &self,
        key: &[u8],
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<(Value, i64)>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let inner = &self.inner;

        let row = match inner.gateway.read(key).await {
            Ok(row) => row,
            Err(error @ CacheError::BackendUnavailable(_))
                if inner.config.serve_stale_on_error =>
            {
                if let Some(stale) = inner.store.lookup_stale(key) {
                    warn!("backend unavailable, serving stale local entry");
                    return Ok(Some((stale.value, stale.version)));
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        if let Some(row) = row {
            if let Some(bytes) = row.value {
                let value = inner.codec.decode(&bytes)?;
                inner.store.install(
                    key,
                    LocalEntry::new(value.clone(), row.version, row.expires_at),
                );
                return Ok(Some((value, row.version)));
            }
        }

        CacheStats::bump(&inner.stats.loader_invocations);
        let loaded = loader().await.map_err(CacheError::loader)?;

        let Some(loaded) = loaded else {
            debug!("loader declined to produce a cacheable value");
            return Ok(None);
        };

        let value = serde_json::to_value(loaded)?;
        let payload = inner.codec.encode(&value)?;
        let version = inner.gateway.upsert(key, &payload, ttl).await?;
        inner
            .store
            .install(key, LocalEntry::new(value.clone(), version, local_expiry(ttl)));

        Ok(Some((value, version)))
    }

    /// Read many keys, local tier first, then one bulk query for the rest.
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<HashMap<String, T>> {
        self.ensure_open()?;
        let inner = &self.inner;

        let fut = async move {
            let mut found: HashMap<String, Value> = HashMap::new();
            let mut missing: Vec<Vec<u8>> = Vec::new();

            for &key in keys {
                let key_bytes = validate_key(key)?;
                match inner.store.lookup(key_bytes) {
                    Some(entry) => {
                        found.insert(key.to_string(), entry.value);
                    }
                    None => missing.push(key_bytes.to_vec()),
                }
            }

            if !missing.is_empty() {
                for (key_bytes, row) in inner.gateway.bulk_read(&missing).await? {
                    let Some(bytes) = row.value else { continue };
                    let value = inner.codec.decode(&bytes)?;
                    inner.store.install(
                        &key_bytes,
                        LocalEntry::new(value.clone(), row.version, row.expires_at),
                    );
                    let key = String::from_utf8_lossy(&key_bytes).into_owned();
                    found.insert(key, value);
                }
            }

            Ok(found)
        };

        let found = self.with_deadline(fut).await?;
        found
            .into_iter()
            .map(|(key, value)| decode_typed(value).map(|typed| (key, typed)))
            .collect()
    }

    /// Store a value with the configured default TTL; returns the assigned
    /// version.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<i64> {
        self.set_with_ttl(key, value, self.inner.config.default_ttl)
            .await
    }

    /// Store a value with an explicit TTL (`None` = no expiry); returns the
    /// assigned version. Writes for the same key in the same process never
    /// overlap.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<i64> {
        self.ensure_open()?;
        let key_bytes = validate_key(key)?;
        let inner = &self.inner;

        // Encoding failures are fatal before any backend work happens.
        let json = serde_json::to_value(value)?;
        let payload = inner.codec.encode(&json)?;

        let fut = async move {
            let guard = inner.write_locks.acquire(key_bytes).await;
            let outcome = inner.gateway.upsert(key_bytes, &payload, ttl).await;
            drop(guard);
            inner.write_locks.release(key_bytes);

            let version = outcome?;
            inner
                .store
                .install(key_bytes, LocalEntry::new(json, version, local_expiry(ttl)));
            Ok(version)
        };

        self.with_deadline(fut).await
    }

    /// Delete a key everywhere. Absent keys are not an error.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key_bytes = validate_key(key)?;
        let inner = &self.inner;

        let fut = async move {
            // Local removal is unconditional, even when the backend call
            // fails: the next read refetches.
            inner.store.invalidate(key_bytes);
            inner.gateway.delete(key_bytes).await?;
            Ok(())
        };

        self.with_deadline(fut).await
    }

    /// Remove only the local entry. The database is not touched.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key_bytes = validate_key(key)?;
        self.inner.store.invalidate(key_bytes);
        Ok(())
    }

    /// Drain in-flight loads (bounded), stop the listener and reaper, and
    /// close the pool. Idempotent; operations after the first call fail with
    /// [`CacheError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.inner.flight.drain(CLOSE_DRAIN_TIMEOUT).await {
            warn!("closing with loads still in flight");
        }

        let listener = self
            .inner
            .listener_task
            .lock()
            .expect("listener task lock poisoned")
            .take();
        if let Some(task) = listener {
            task.abort();
        }

        let reaper = self
            .inner
            .reaper_task
            .lock()
            .expect("reaper task lock poisoned")
            .take();
        if let Some(task) = reaper {
            task.abort();
        }

        self.inner.pool.close().await;
        info!("cache client closed");
        Ok(())
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The resolved database object names for this client's prefix.
    pub fn schema_names(&self) -> &SchemaNames {
        &self.inner.names
    }

    /// Number of entries currently held in the local tier.
    pub fn local_len(&self) -> usize {
        self.inner.store.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    async fn read_value(&self, key: &[u8]) -> Result<Option<Value>> {
        let inner = &self.inner;

        if let Some(entry) = inner.store.lookup(key) {
            return Ok(Some(entry.value));
        }

        match inner.gateway.read(key).await {
            Ok(Some(row)) => {
                let Some(bytes) = row.value else {
                    // Tombstone-in-transit: the row exists but carries no
                    // value yet. Treated as absent.
                    return Ok(None);
                };
                let value = inner.codec.decode(&bytes)?;
                inner.store.install(
                    key,
                    LocalEntry::new(value.clone(), row.version, row.expires_at),
                );
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(error @ CacheError::BackendUnavailable(_))
                if inner.config.serve_stale_on_error =>
            {
                match inner.store.lookup_stale(key) {
                    Some(stale) => {
                        warn!("backend unavailable, serving stale local entry");
                        Ok(Some(stale.value))
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.inner.config.op_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Cancelled),
            },
            None => fut.await,
        }
    }
}

impl std::fmt::Debug for PostgresCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCache")
            .field("prefix", &self.inner.config.object_prefix)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .field("local_len", &self.inner.store.len())
            .finish()
    }
}
