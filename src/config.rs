//! Configuration for the cache client.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Allowed shape for an object prefix: it is woven into table, function,
/// trigger and channel names and must stay a plain SQL identifier.
const PREFIX_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,30}$";

fn prefix_regex() -> &'static Regex {
    static PREFIX_RE: OnceLock<Regex> = OnceLock::new();
    PREFIX_RE.get_or_init(|| Regex::new(PREFIX_PATTERN).expect("prefix pattern is valid"))
}

/// Configuration for a [`PostgresCache`](crate::cache::PostgresCache) client.
///
/// All options besides `dsn` have defaults. Validation happens once at
/// construction; a validated config never produces `Config` errors at steady
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Database connection string (required).
    pub dsn: String,

    /// Namespace token woven into every database object name and the
    /// notification channel. Restricted to `[A-Za-z_][A-Za-z0-9_]{0,30}`.
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,

    /// Notification channel override. Defaults to `"<prefix>_events"`.
    #[serde(default)]
    pub notify_channel: Option<String>,

    /// When true, no listener is started and coherence degrades to TTL-only.
    /// The historical misspelling `disable_notiffy` is accepted on input.
    #[serde(default, alias = "disable_notiffy")]
    pub disable_notify: bool,

    /// Capacity of the local tier. 0 disables it entirely.
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// TTL applied when a call does not override it. `None` means no expiry.
    #[serde(default)]
    pub default_ttl: Option<Duration>,

    /// Connection pool capacity.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Deadline for acquiring a pooled connection.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,

    /// Per-call deadline for public cache operations. Elapsing surfaces
    /// [`CacheError::Cancelled`]. `None` means no deadline.
    #[serde(default)]
    pub op_timeout: Option<Duration>,

    /// Initial back-off between listener reconnect attempts.
    #[serde(default = "default_reconnect_backoff")]
    pub listener_reconnect_backoff: Duration,

    /// Upper bound for the listener reconnect back-off.
    #[serde(default = "default_reconnect_backoff_max")]
    pub listener_reconnect_backoff_max: Duration,

    /// When the database is unavailable on a read path, fall back to a
    /// present (possibly expired) local entry instead of failing.
    #[serde(default)]
    pub serve_stale_on_error: bool,

    /// Cadence of the local expiry sweep.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval: Duration,

    /// Batch size for the background database sweep of expired rows.
    /// 0 disables the sweep.
    #[serde(default)]
    pub sweep_batch: u32,
}

fn default_object_prefix() -> String {
    "cache".to_string()
}

fn default_local_max_entries() -> usize {
    10_000
}

fn default_pool_size() -> u32 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_reconnect_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(1)
}

impl CacheConfig {
    /// Create a configuration with defaults for the given DSN.
    pub fn new<S: Into<String>>(dsn: S) -> Self {
        Self {
            dsn: dsn.into(),
            object_prefix: default_object_prefix(),
            notify_channel: None,
            disable_notify: false,
            local_max_entries: default_local_max_entries(),
            default_ttl: None,
            pool_size: default_pool_size(),
            acquire_timeout: default_acquire_timeout(),
            op_timeout: None,
            listener_reconnect_backoff: default_reconnect_backoff(),
            listener_reconnect_backoff_max: default_reconnect_backoff_max(),
            serve_stale_on_error: false,
            reaper_interval: default_reaper_interval(),
            sweep_batch: 0,
        }
    }

    /// Set the object prefix.
    pub fn with_object_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.object_prefix = prefix.into();
        self
    }

    /// Override the notification channel name.
    pub fn with_notify_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.notify_channel = Some(channel.into());
        self
    }

    /// Enable or disable the notification listener.
    pub fn with_notify_disabled(mut self, disabled: bool) -> Self {
        self.disable_notify = disabled;
        self
    }

    /// Set the local tier capacity (0 disables it).
    pub fn with_local_max_entries(mut self, entries: usize) -> Self {
        self.local_max_entries = entries;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the connection pool capacity.
    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the per-call operation deadline.
    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the listener reconnect back-off range.
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.listener_reconnect_backoff = initial;
        self.listener_reconnect_backoff_max = max;
        self
    }

    /// Enable serving stale local entries when the backend is unavailable.
    pub fn with_serve_stale_on_error(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    /// Set the local expiry sweep cadence.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the background database sweep batch size (0 disables it).
    pub fn with_sweep_batch(mut self, batch: u32) -> Self {
        self.sweep_batch = batch;
        self
    }

    /// The notification channel in effect: the override, or `<prefix>_events`.
    pub fn channel(&self) -> String {
        match &self.notify_channel {
            Some(channel) => channel.clone(),
            None => format!("{}_events", self.object_prefix),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dsn.is_empty() {
            return Err(CacheError::config("dsn must not be empty"));
        }

        if !prefix_regex().is_match(&self.object_prefix) {
            return Err(CacheError::config(format!(
                "object_prefix {:?} must match {}",
                self.object_prefix, PREFIX_PATTERN
            )));
        }

        if let Some(channel) = &self.notify_channel {
            if !prefix_regex().is_match(channel) {
                return Err(CacheError::config(format!(
                    "notify_channel {:?} must match {}",
                    channel, PREFIX_PATTERN
                )));
            }
        }

        if self.pool_size == 0 {
            return Err(CacheError::config("pool_size must be at least 1"));
        }

        if self.listener_reconnect_backoff.is_zero() {
            return Err(CacheError::config(
                "listener_reconnect_backoff must be non-zero",
            ));
        }

        if self.listener_reconnect_backoff_max < self.listener_reconnect_backoff {
            return Err(CacheError::config(
                "listener_reconnect_backoff_max must be >= listener_reconnect_backoff",
            ));
        }

        if self.reaper_interval.is_zero() {
            return Err(CacheError::config("reaper_interval must be non-zero"));
        }

        Ok(())
    }
}
