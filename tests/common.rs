//! Shared helpers for integration tests.
//!
//! Every test runs against the database named by `DATABASE_URL` and skips
//! (early-returns) when it is unset. Each test gets a unique object prefix so
//! suites can run in parallel against one database.

use std::future::Future;
use std::time::{Duration, Instant};

use pgcache::{CacheConfig, PostgresCache};
use sqlx::PgPool;
use uuid::Uuid;

pub fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty())
}

/// One isolated cache namespace in the test database.
pub struct TestNamespace {
    pub dsn: String,
    pub prefix: String,
}

impl TestNamespace {
    /// Returns `None` when no `DATABASE_URL` is provided; callers skip.
    pub fn new() -> Option<Self> {
        let dsn = database_url()?;
        let suffix = Uuid::new_v4().simple().to_string();
        Some(Self {
            dsn,
            prefix: format!("t{}", &suffix[..8]),
        })
    }

    /// Base configuration for this namespace. Pool kept small so many
    /// clients fit under the server connection limit.
    pub fn config(&self) -> CacheConfig {
        CacheConfig::new(&self.dsn)
            .with_object_prefix(&self.prefix)
            .with_pool_size(2)
    }

    pub async fn connect(&self) -> PostgresCache {
        PostgresCache::connect(self.config())
            .await
            .expect("failed to connect cache client")
    }

    pub async fn connect_with(&self, config: CacheConfig) -> PostgresCache {
        PostgresCache::connect(config)
            .await
            .expect("failed to connect cache client")
    }

    /// Drop every database object created under this prefix.
    pub async fn cleanup(&self) {
        let pool = PgPool::connect(&self.dsn)
            .await
            .expect("failed to connect for cleanup");
        let p = &self.prefix;
        for sql in [
            format!("DROP TABLE IF EXISTS {p}_entries CASCADE"),
            format!("DROP TABLE IF EXISTS {p}_meta CASCADE"),
            format!("DROP SEQUENCE IF EXISTS {p}_version_seq"),
            format!("DROP FUNCTION IF EXISTS {p}_upsert(BYTEA, BYTEA, BIGINT)"),
            format!("DROP FUNCTION IF EXISTS {p}_delete(BYTEA)"),
            format!("DROP FUNCTION IF EXISTS {p}_broadcast() CASCADE"),
        ] {
            let _ = sqlx::query(&sql).execute(&pool).await;
        }
        pool.close().await;
    }
}

/// Poll `check` until it reports true or `deadline` elapses.
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
