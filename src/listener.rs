//! Notification listener keeping the local tier coherent.
//!
//! One dedicated connection (never borrowed from the pool) stays subscribed
//! to the prefix-scoped channel. Malformed payloads are counted and dropped;
//! a listener fault is never surfaced to callers. After any connection gap
//! the listener resyncs by invalidating the local tier wholesale, because
//! events emitted during the gap are gone for good.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CacheError;
use crate::events::CacheEvent;
use crate::stats::CacheStats;

/// Receives decoded invalidation events and resync notices.
///
/// The facade installs a handler that applies events to the local store;
/// embedders can layer their own observer on top of it.
#[async_trait]
pub trait CacheEventHandler: Send + Sync {
    /// Handle a decoded event.
    async fn handle_event(&self, event: CacheEvent);

    /// Handle a payload that failed strict validation.
    async fn handle_decode_error(&self, payload: &str, error: CacheError) {
        warn!(%error, payload, "discarding malformed cache event");
    }

    /// Called after a connection gap, before new events flow again. Anything
    /// cached locally may have been mutated unseen.
    async fn handle_resync(&self);
}

pub(crate) struct CacheListener {
    dsn: String,
    channel: String,
    backoff_initial: Duration,
    backoff_max: Duration,
    handler: Arc<dyn CacheEventHandler>,
    stats: Arc<CacheStats>,
}

impl CacheListener {
    pub fn new(
        dsn: String,
        channel: String,
        backoff_initial: Duration,
        backoff_max: Duration,
        handler: Arc<dyn CacheEventHandler>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            dsn,
            channel,
            backoff_initial,
            backoff_max,
            handler,
            stats,
        }
    }

    /// Spawn the consumer loop as a background task. The task runs until
    /// aborted by `close()`.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn run(self) {
        let mut backoff = self.backoff_initial;
        // No resync on the very first connect: the local store is empty.
        let mut resync_pending = false;

        loop {
            let mut listener = match PgListener::connect(&self.dsn).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "listener connect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                    continue;
                }
            };

            if let Err(e) = listener.listen(&self.channel).await {
                error!(error = %e, "LISTEN failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.backoff_max);
                continue;
            }

            backoff = self.backoff_initial;
            info!("listening for cache events");

            if resync_pending {
                self.resync().await;
                resync_pending = false;
            }

            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        CacheStats::bump(&self.stats.events_received);
                        self.dispatch(notification.payload()).await;
                    }
                    Ok(None) => {
                        // The connection dropped and events in the gap are
                        // lost for good. Rebuild the subscription; the resync
                        // runs once LISTEN is active again, so nothing cached
                        // in between escapes invalidation.
                        warn!("listener connection lost, rebuilding subscription");
                        resync_pending = true;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "listener receive failed, reconnecting");
                        resync_pending = true;
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.backoff_max);
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, payload: &str) {
        match CacheEvent::decode(payload) {
            Ok(event) => {
                debug!(op = ?event.op, version = event.version, "cache event received");
                self.handler.handle_event(event).await;
            }
            Err(error) => {
                CacheStats::bump(&self.stats.events_discarded);
                self.handler.handle_decode_error(payload, error).await;
            }
        }
    }

    async fn resync(&self) {
        CacheStats::bump(&self.stats.listener_reconnects);
        self.handler.handle_resync().await;
    }
}
