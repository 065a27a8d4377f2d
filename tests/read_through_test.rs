//! Integration tests for the read-through path: single-flight loads, local
//! serving, TTL expiry, deletes and the do-not-cache sentinel.
//!
//! Requires `DATABASE_URL`; every test skips silently without it.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, TestNamespace};
use futures::future::join_all;
use pgcache::CacheError;
use serde_json::{json, Value};

#[tokio::test]
async fn concurrent_callers_share_one_loader_invocation() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;
    let invocations = Arc::new(AtomicU64::new(0));

    let calls = (0..50).map(|_| {
        let cache = cache.clone();
        let invocations = Arc::clone(&invocations);
        async move {
            cache
                .get_or_load::<Value, _, _>("hot-key", move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some(json!({"counter": 1})))
                })
                .await
        }
    });

    let results = join_all(calls).await;
    for result in results {
        assert_eq!(result.unwrap().unwrap(), json!({"counter": 1}));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().loader_invocations, 1);

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn repeated_reads_are_served_locally() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;

    let loaded: Option<Value> = cache
        .get_or_load("local-key", || async { Ok(Some(json!({"n": 7}))) })
        .await
        .unwrap();
    assert_eq!(loaded.unwrap(), json!({"n": 7}));

    let reads_after_load = cache.stats().db_reads;
    let cached: Option<Value> = cache.get("local-key").await.unwrap();
    assert_eq!(cached.unwrap(), json!({"n": 7}));

    let stats = cache.stats();
    assert_eq!(stats.db_reads, reads_after_load, "second read stayed local");
    assert!(stats.local_hits >= 1);

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn loader_errors_propagate_and_are_not_cached() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;

    let err = cache
        .get_or_load::<Value, _, _>("flaky-key", || async {
            Err(anyhow::anyhow!("upstream down"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Loader(_)));
    assert!(err.to_string().contains("upstream down"));

    // The failure left the key absent: the next call runs the loader again.
    let value: Option<Value> = cache
        .get_or_load("flaky-key", || async { Ok(Some(json!("recovered"))) })
        .await
        .unwrap();
    assert_eq!(value.unwrap(), json!("recovered"));
    assert_eq!(cache.stats().loader_invocations, 2);

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn do_not_cache_sentinel_stores_nothing() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;

    let value: Option<Value> = cache
        .get_or_load("sentinel-key", || async { Ok(None) })
        .await
        .unwrap();
    assert!(value.is_none());

    // Nothing was stored: another call invokes the loader again.
    let value: Option<Value> = cache
        .get_or_load("sentinel-key", || async { Ok(Some(json!(1))) })
        .await
        .unwrap();
    assert_eq!(value.unwrap(), json!(1));
    assert_eq!(cache.stats().loader_invocations, 2);

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn set_get_delete_round_trip() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;

    let v1 = cache.set("rt-key", &json!({"payload": "a"})).await.unwrap();
    let read: Option<Value> = cache.get("rt-key").await.unwrap();
    assert_eq!(read.unwrap(), json!({"payload": "a"}));

    let v2 = cache.set("rt-key", &json!({"payload": "b"})).await.unwrap();
    assert!(v2 > v1, "versions are monotonic across writes");

    cache.delete("rt-key").await.unwrap();
    let read: Option<Value> = cache.get("rt-key").await.unwrap();
    assert!(read.is_none());

    // Deleting an absent key is not an error.
    cache.delete("rt-key").await.unwrap();

    // A deleted key re-invokes the loader.
    let reloaded: Option<Value> = cache
        .get_or_load("rt-key", || async { Ok(Some(json!({"payload": "c"}))) })
        .await
        .unwrap();
    assert_eq!(reloaded.unwrap(), json!({"payload": "c"}));
    assert_eq!(cache.stats().loader_invocations, 1);

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn ttl_expiry_without_notifications_rereads_the_backend() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    // Two clients, notifications disabled: coherence comes from TTL alone.
    let reader = ns
        .connect_with(
            ns.config()
                .with_notify_disabled(true)
                .with_reaper_interval(Duration::from_millis(50)),
        )
        .await;
    let writer = ns
        .connect_with(ns.config().with_notify_disabled(true))
        .await;

    writer
        .set_with_ttl("ttl-key", &json!("v1"), Some(Duration::from_millis(150)))
        .await
        .unwrap();

    // Reader caches v1 under its 150ms expiry.
    let seen: Option<Value> = reader.get("ttl-key").await.unwrap();
    assert_eq!(seen.unwrap(), json!("v1"));

    // A peer mutation the reader cannot hear about.
    writer
        .set_with_ttl("ttl-key", &json!("v2"), Some(Duration::from_secs(10)))
        .await
        .unwrap();

    // Until the local entry expires the reader may still serve v1; after
    // expiry it must re-read the backend and observe v2.
    let converged = wait_for(Duration::from_secs(3), || {
        let reader = reader.clone();
        async move {
            reader.get::<Value>("ttl-key").await.unwrap() == Some(json!("v2"))
        }
    })
    .await;
    assert!(converged, "reader re-read the backend after TTL expiry");

    reader.close().await.unwrap();
    writer.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn expired_entries_vanish_entirely() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns
        .connect_with(
            ns.config()
                .with_notify_disabled(true)
                .with_default_ttl(Some(Duration::from_millis(100)))
                .with_reaper_interval(Duration::from_millis(50)),
        )
        .await;

    cache.set("short-key", &json!(1)).await.unwrap();
    let seen: Option<Value> = cache.get("short-key").await.unwrap();
    assert!(seen.is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;

    // Past expiry the key is absent in both tiers.
    let seen: Option<Value> = cache.get("short-key").await.unwrap();
    assert!(seen.is_none());

    cache.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn get_many_mixes_local_and_bulk_reads() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let writer = ns.connect().await;
    let reader = ns.connect().await;

    for i in 0..5 {
        writer
            .set(&format!("bulk-{i}"), &json!({"i": i}))
            .await
            .unwrap();
    }

    // Warm one key locally, then multi-get across warm and cold keys.
    let _: Option<Value> = reader.get("bulk-0").await.unwrap();

    let keys = ["bulk-0", "bulk-1", "bulk-2", "bulk-3", "bulk-4", "bulk-absent"];
    let found = reader.get_many::<Value>(&keys).await.unwrap();
    assert_eq!(found.len(), 5);
    for i in 0..5 {
        assert_eq!(found[&format!("bulk-{i}")], json!({"i": i}));
    }
    assert!(!found.contains_key("bulk-absent"));

    writer.close().await.unwrap();
    reader.close().await.unwrap();
    ns.cleanup().await;
}

#[tokio::test]
async fn operations_after_close_fail() {
    let Some(ns) = TestNamespace::new() else {
        println!("skipping - no DATABASE_URL provided");
        return;
    };

    let cache = ns.connect().await;
    cache.close().await.unwrap();

    assert!(matches!(
        cache.get::<Value>("k").await.unwrap_err(),
        CacheError::Closed
    ));
    assert!(matches!(
        cache.set("k", &json!(1)).await.unwrap_err(),
        CacheError::Closed
    ));
    assert!(matches!(
        cache.delete("k").await.unwrap_err(),
        CacheError::Closed
    ));
    assert!(matches!(
        cache.invalidate("k").unwrap_err(),
        CacheError::Closed
    ));

    // close() is idempotent.
    cache.close().await.unwrap();
    ns.cleanup().await;
}
