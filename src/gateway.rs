//! Typed access to the cache table through the shared connection pool.
//!
//! All statements go through the stored procedures and prefix-derived names
//! produced by the schema layer, so the gateway builds its SQL once at
//! construction. Idempotent reads retry transient connection failures with
//! bounded exponential back-off; writes never retry, because a failed write
//! gives no proof the transaction missed its commit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::error::{CacheError, Result};
use crate::schema::SchemaNames;
use crate::stats::CacheStats;

const READ_RETRIES: u32 = 3;
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(800);

/// A row from the entries table, already filtered for freshness.
#[derive(Debug, Clone)]
pub struct RowEntry {
    /// Payload bytes; `None` marks a tombstone-in-transit and is treated as
    /// absent by the facade.
    pub value: Option<Vec<u8>>,
    pub version: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub(crate) struct Gateway {
    pool: PgPool,
    stats: Arc<CacheStats>,
    read_sql: String,
    bulk_read_sql: String,
    upsert_sql: String,
    delete_sql: String,
    sweep_sql: String,
}

fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_)
    )
}

fn row_entry(row: &sqlx::postgres::PgRow) -> RowEntry {
    RowEntry {
        value: row.get("value"),
        version: row.get("version"),
        expires_at: row.get("expires_at"),
    }
}

impl Gateway {
    pub fn new(pool: PgPool, names: &SchemaNames, stats: Arc<CacheStats>) -> Self {
        let entries = &names.entries_table;
        Self {
            pool,
            stats,
            read_sql: format!(
                "SELECT value, version, expires_at FROM {entries} \
                 WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())"
            ),
            bulk_read_sql: format!(
                "SELECT key, value, version, expires_at FROM {entries} \
                 WHERE key = ANY($1) AND (expires_at IS NULL OR expires_at > now())"
            ),
            upsert_sql: format!("SELECT {}($1, $2, $3)", names.upsert_fn),
            delete_sql: format!("SELECT {}($1)", names.delete_fn),
            sweep_sql: format!(
                "DELETE FROM {entries} WHERE ctid IN (SELECT ctid FROM {entries} \
                 WHERE expires_at IS NOT NULL AND expires_at <= now() LIMIT $1)"
            ),
        }
    }

    /// Read one row, treating rows past their TTL as absent.
    #[instrument(skip(self), fields(key_len = key.len()))]
    pub async fn read(&self, key: &[u8]) -> Result<Option<RowEntry>> {
        CacheStats::bump(&self.stats.db_reads);
        let sql = self.read_sql.as_str();
        let pool = &self.pool;
        self.retry_read("read", move || async move {
            let row = sqlx::query(sql).bind(key).fetch_optional(pool).await?;
            Ok(row.as_ref().map(row_entry))
        })
        .await
    }

    /// Read many rows in one round trip.
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub async fn bulk_read(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, RowEntry)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        CacheStats::bump(&self.stats.db_reads);
        let sql = self.bulk_read_sql.as_str();
        let pool = &self.pool;
        self.retry_read("bulk_read", move || async move {
            let rows = sqlx::query(sql).bind(keys).fetch_all(pool).await?;
            Ok(rows
                .iter()
                .map(|row| (row.get::<Vec<u8>, _>("key"), row_entry(row)))
                .collect())
        })
        .await
    }

    /// Upsert a payload through the stored procedure; returns the freshly
    /// assigned version. The broadcast trigger fires inside the same
    /// transaction.
    #[instrument(skip(self, payload), fields(key_len = key.len(), payload_len = payload.len()))]
    pub async fn upsert(&self, key: &[u8], payload: &[u8], ttl: Option<Duration>) -> Result<i64> {
        CacheStats::bump(&self.stats.db_writes);
        let ttl_ms = ttl.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let version: Option<i64> = sqlx::query_scalar(&self.upsert_sql)
            .bind(key)
            .bind(payload)
            .bind(ttl_ms)
            .fetch_one(&self.pool)
            .await?;

        version.ok_or_else(|| {
            CacheError::BackendUnavailable("upsert procedure returned NULL version".to_string())
        })
    }

    /// Delete a row; returns the version of the deleted row, or `None` when
    /// the key was absent.
    #[instrument(skip(self), fields(key_len = key.len()))]
    pub async fn delete(&self, key: &[u8]) -> Result<Option<i64>> {
        CacheStats::bump(&self.stats.db_writes);
        let version: Option<i64> = sqlx::query_scalar(&self.delete_sql)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Delete up to `batch` expired rows; returns how many went away.
    pub async fn sweep_expired(&self, batch: u32) -> Result<u64> {
        let result = sqlx::query(&self.sweep_sql)
            .bind(i64::from(batch))
            .execute(&self.pool)
            .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            debug!(swept, "removed expired cache rows");
        }
        Ok(swept)
    }

    async fn retry_read<T, F, Fut>(&self, op: &'static str, mut query: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut backoff = RETRY_BACKOFF_INITIAL;
        let mut attempt = 0;
        loop {
            match query().await {
                Ok(value) => return Ok(value),
                Err(error) if is_transient(&error) && attempt < READ_RETRIES => {
                    attempt += 1;
                    warn!(op, attempt, error = %error, "transient database error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }
                Err(error) => return Err(CacheError::from(error)),
            }
        }
    }
}
