//! Schema bootstrap for a cache namespace.
//!
//! Every database object is named under the configured object prefix so that
//! independent cache namespaces can share one database without sharing a
//! trigger or channel. Creation is idempotent and serialized through an
//! advisory lock; an incompatible schema version found in the metadata table
//! is a configuration error that requires an out-of-band migration.

use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Schema version written to the metadata table. Bumped on incompatible
/// layout changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Resolved names of every database object for a given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNames {
    pub entries_table: String,
    pub meta_table: String,
    pub version_seq: String,
    pub upsert_fn: String,
    pub delete_fn: String,
    pub broadcast_fn: String,
    pub broadcast_trigger: String,
    pub expires_index: String,
    pub default_channel: String,
}

impl SchemaNames {
    /// Derive all object names from an object prefix.
    pub fn resolve(prefix: &str) -> Self {
        Self {
            entries_table: format!("{prefix}_entries"),
            meta_table: format!("{prefix}_meta"),
            version_seq: format!("{prefix}_version_seq"),
            upsert_fn: format!("{prefix}_upsert"),
            delete_fn: format!("{prefix}_delete"),
            broadcast_fn: format!("{prefix}_broadcast"),
            broadcast_trigger: format!("{prefix}_broadcast"),
            expires_index: format!("{prefix}_entries_expires_at_idx"),
            default_channel: format!("{prefix}_events"),
        }
    }
}

/// Deterministic advisory-lock key for a prefix, so concurrent initializers
/// of the same namespace serialize while distinct namespaces do not contend.
fn advisory_lock_key(prefix: &str) -> i64 {
    // FNV-1a, folded into the salt. Stable across processes and builds.
    const SALT: u64 = 0x7067_6361_6368_6500; // "pgcache\0"
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in prefix.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash ^ SALT) as i64
}

/// Idempotently creates the cache table, trigger, helper functions and
/// metadata row for a namespace.
pub struct SchemaManager;

impl SchemaManager {
    /// Ensure the schema for `config`'s prefix exists and is compatible.
    #[instrument(skip(pool, config), fields(prefix = %config.object_prefix))]
    pub async fn ensure(pool: &PgPool, config: &CacheConfig) -> Result<()> {
        config.validate()?;

        let names = SchemaNames::resolve(&config.object_prefix);
        let channel = config.channel();
        let lock_key = advisory_lock_key(&config.object_prefix);

        // Advisory locks are session-scoped: hold one connection for the
        // whole bootstrap so lock and unlock land on the same session.
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_key)
            .execute(&mut *conn)
            .await?;

        let result = Self::ensure_locked(&mut conn, &names, &channel).await;

        // Unlock regardless of the outcome; a failed unlock only matters if
        // the connection survives, and an errored connection is discarded.
        let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_key)
            .execute(&mut *conn)
            .await;

        result
    }

    async fn ensure_locked(
        conn: &mut sqlx::PgConnection,
        names: &SchemaNames,
        channel: &str,
    ) -> Result<()> {
        if let Some(found) = Self::installed_version(conn, names).await? {
            if found == SCHEMA_VERSION {
                debug!(version = found, "cache schema already present");
                return Ok(());
            }
            return Err(CacheError::config(format!(
                "cache schema version {found} found for prefix objects {:?}, \
                 this build requires {SCHEMA_VERSION}; run an out-of-band migration",
                names.entries_table
            )));
        }

        info!(table = %names.entries_table, channel = %channel, "creating cache schema");

        sqlx::raw_sql(&Self::bootstrap_sql(names, channel))
            .execute(&mut *conn)
            .await?;

        sqlx::query(&format!(
            "INSERT INTO {meta} (schema_version) SELECT $1 \
             WHERE NOT EXISTS (SELECT 1 FROM {meta})",
            meta = names.meta_table
        ))
        .bind(SCHEMA_VERSION)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Read the installed schema version, or `None` when the namespace has
    /// never been initialized.
    async fn installed_version(
        conn: &mut sqlx::PgConnection,
        names: &SchemaNames,
    ) -> Result<Option<i32>> {
        // Unquoted identifiers fold to lowercase, so the catalog stores the
        // folded name even for a mixed-case prefix.
        let meta_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT FROM information_schema.tables \
             WHERE table_name = $1 AND table_schema = current_schema())",
        )
        .bind(names.meta_table.to_lowercase())
        .fetch_one(&mut *conn)
        .await?;

        if !meta_exists {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "SELECT schema_version FROM {} ORDER BY created_at DESC LIMIT 1",
            names.meta_table
        ))
        .fetch_optional(conn)
        .await?;

        Ok(row.map(|r| r.get::<i32, _>("schema_version")))
    }

    /// Full DDL for one namespace. Identifiers come from the validated
    /// prefix, so interpolation is safe.
    fn bootstrap_sql(names: &SchemaNames, channel: &str) -> String {
        let SchemaNames {
            entries_table,
            meta_table,
            version_seq,
            upsert_fn,
            delete_fn,
            broadcast_fn,
            broadcast_trigger,
            expires_index,
            ..
        } = names;

        format!(
            r#"
CREATE TABLE IF NOT EXISTS {entries_table} (
    key BYTEA PRIMARY KEY,
    value BYTEA NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at TIMESTAMPTZ NULL
);

CREATE INDEX IF NOT EXISTS {expires_index} ON {entries_table} (expires_at);

CREATE SEQUENCE IF NOT EXISTS {version_seq};

CREATE TABLE IF NOT EXISTS {meta_table} (
    schema_version INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE OR REPLACE FUNCTION {upsert_fn}(p_key BYTEA, p_value BYTEA, p_ttl_ms BIGINT)
RETURNS BIGINT AS $$
DECLARE
    v_version BIGINT := nextval('{version_seq}');
    v_expires TIMESTAMPTZ := CASE
        WHEN p_ttl_ms IS NULL THEN NULL
        ELSE now() + make_interval(secs => p_ttl_ms / 1000.0)
    END;
BEGIN
    INSERT INTO {entries_table} (key, value, version, created_at, expires_at)
    VALUES (p_key, p_value, v_version, now(), v_expires)
    ON CONFLICT (key) DO UPDATE
        SET value = EXCLUDED.value,
            version = EXCLUDED.version,
            created_at = EXCLUDED.created_at,
            expires_at = EXCLUDED.expires_at;
    RETURN v_version;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION {delete_fn}(p_key BYTEA)
RETURNS BIGINT AS $$
DECLARE
    v_version BIGINT;
BEGIN
    DELETE FROM {entries_table} WHERE key = p_key RETURNING version INTO v_version;
    RETURN v_version;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION {broadcast_fn}()
RETURNS trigger AS $$
DECLARE
    v_payload TEXT;
BEGIN
    IF TG_OP = 'DELETE' THEN
        v_payload := json_build_object(
            'op', 'delete',
            'key', replace(encode(OLD.key, 'base64'), E'\n', ''),
            'version', OLD.version,
            'expires_at', NULL
        )::text;
    ELSE
        v_payload := json_build_object(
            'op', 'upsert',
            'key', replace(encode(NEW.key, 'base64'), E'\n', ''),
            'version', NEW.version,
            'expires_at', CASE
                WHEN NEW.expires_at IS NULL THEN NULL
                ELSE to_char(NEW.expires_at AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"')
            END
        )::text;
    END IF;
    PERFORM pg_notify('{channel}', v_payload);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS {broadcast_trigger} ON {entries_table};
CREATE TRIGGER {broadcast_trigger}
AFTER INSERT OR UPDATE OR DELETE ON {entries_table}
FOR EACH ROW EXECUTE FUNCTION {broadcast_fn}();
"#
        )
    }
}
