//! End-to-end behaviour of the gateway and its quota, cache and batching
//! components against the in-memory store.

use futures::future::{join_all, BoxFuture};
use quotagate::config::{ConfigPatch, GatewayConfig};
use quotagate::quota::{AdmitDecision, QuotaTier};
use quotagate::{
    Collaborators, ExecuteOptions, ExecutionGateway, GatewayError, MemoryStore, QueryError,
    QuotaTracker, ResultCache,
};
use quotagate_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Query = BoxFuture<'static, Result<Value, QueryError>>;

fn collaborators(store: &MemoryStore, seed: u64) -> Collaborators {
    Collaborators {
        store: Arc::new(store.clone()),
        breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 50,
            ..Default::default()
        })),
        random: Box::new(StdRng::seed_from_u64(seed)),
    }
}

fn gateway(config: GatewayConfig, store: &MemoryStore) -> Arc<ExecutionGateway> {
    Arc::new(ExecutionGateway::new(config, collaborators(store, 7)).unwrap())
}

fn read(store: &MemoryStore, key: &str) -> impl Fn() -> Query + Send + Sync + 'static {
    let store = store.clone();
    let key = key.to_string();
    move || -> Query {
        let store = store.clone();
        let key = key.clone();
        Box::pin(async move { store.query(&key).await })
    }
}

#[tokio::test]
async fn test_throttles_about_half_at_95_percent() {
    let config = GatewayConfig {
        max_data_transfer_mb: 100.0,
        ..Default::default()
    };
    let tracker = QuotaTracker::with_random(&config, Box::new(StdRng::seed_from_u64(42)));
    tracker.record_transfer(95.0);
    assert_eq!(tracker.status().tier, QuotaTier::High);

    let decisions: Vec<AdmitDecision> = (0..1_000).map(|_| tracker.check_admit()).collect();
    let throttled = decisions
        .iter()
        .filter(|d| **d == AdmitDecision::Throttle)
        .count();

    assert!(
        (400..=600).contains(&throttled),
        "expected roughly half throttled, got {}",
        throttled
    );
    assert!(!decisions.contains(&AdmitDecision::Deny));
    assert!(!tracker.is_emergency());

    tracker.force_reset();
    for _ in 0..100 {
        assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
    }
}

#[tokio::test(start_paused = true)]
async fn test_eviction_keeps_recently_used_entries() {
    let cache = ResultCache::new(10, 1024 * 1024, Duration::from_secs(300));
    for i in 1..=10 {
        cache.set(&format!("key{}", i), i, None);
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    assert_eq!(cache.get::<i32>("key1"), Some(1));

    cache.set("key11", 11, None);
    cache.set("key12", 12, None);

    assert!(cache.len() <= 10);
    assert_eq!(cache.get::<i32>("key1"), Some(1));
    assert_eq!(cache.get::<i32>("key12"), Some(12));
    assert_eq!(cache.get::<i32>("key2"), None);
    assert_eq!(cache.metrics().evictions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_window_rolls_over_after_duration() {
    let config = GatewayConfig {
        max_data_transfer_mb: 100.0,
        data_transfer_window_ms: 300_000,
        ..Default::default()
    };
    let tracker = QuotaTracker::with_random(&config, Box::new(StdRng::seed_from_u64(1)));
    tracker.record_transfer(100.0);
    assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

    tokio::time::advance(Duration::from_millis(300_001)).await;
    assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
    assert_eq!(tracker.status().used_mb, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_is_sticky_until_dwell_and_recovery() {
    let store = MemoryStore::new();
    store.insert("k", json!("v"));
    let config = GatewayConfig {
        max_connections: 6,
        cache_ttl_ms: 10_000,
        max_data_transfer_mb: 10.0,
        data_transfer_window_ms: 60_000,
        ..Default::default()
    };
    let gw = gateway(config, &store);

    gw.quota().record_transfer(9.9);
    gw.quota_housekeeping().await;
    let status = gw.quota_status();
    assert!(status.emergency);
    assert_eq!(status.emergency_activations, 1);
    assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(40));
    assert_eq!(gw.connection_metrics().await.max_connections, 2);
    assert_eq!(gw.connection_metrics().await.breaker.state, "open");

    // The window rolls over but the dwell has not elapsed
    tokio::time::advance(Duration::from_secs(61)).await;
    gw.quota_housekeeping().await;
    assert_eq!(gw.quota_status().used_mb, 0.0);
    assert!(gw.quota_status().emergency);
    let err = gw
        .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::QuotaExceeded {
            decision: AdmitDecision::Deny,
            ..
        }
    ));

    tokio::time::advance(Duration::from_secs(240)).await;
    gw.quota_housekeeping().await;
    assert!(!gw.quota_status().emergency);
    assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(10));
    assert_eq!(gw.connection_metrics().await.max_connections, 6);

    let value: Value = gw
        .execute_select(read(&store, "k"), "k", None)
        .await
        .unwrap();
    assert_eq!(value, json!("v"));
    assert!(gw
        .quota_status()
        .recent_alerts
        .iter()
        .any(|a| a.message.contains("lifted")));
}

#[tokio::test(start_paused = true)]
async fn test_emergency_keeps_overrides_across_config_update() {
    let store = MemoryStore::new();
    let gw = gateway(
        GatewayConfig {
            max_data_transfer_mb: 10.0,
            ..Default::default()
        },
        &store,
    );
    gw.quota().record_transfer(10.0);
    gw.quota_housekeeping().await;
    assert!(gw.quota_status().emergency);

    gw.update_config(ConfigPatch {
        max_connections: Some(20),
        cache_ttl_ms: Some(1_000),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(gw.connection_metrics().await.max_connections, 2);
    assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(4));

    gw.force_quota_reset().await;
    assert_eq!(gw.connection_metrics().await.max_connections, 20);
    assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_batched_failure_is_isolated() {
    let store = MemoryStore::new();
    store.insert("a", json!(1));
    store.insert("c", json!(3));
    let gw = gateway(
        GatewayConfig {
            max_retries: 1,
            max_batch_size: 3,
            ..Default::default()
        },
        &store,
    );

    let failing = || async { Err::<Value, _>(QueryError::Permanent("bad row".into())) };
    let (a, b, c) = tokio::join!(
        gw.execute(read(&store, "a"), ExecuteOptions::keyed("a").batchable()),
        gw.execute(failing, ExecuteOptions::keyed("b").batchable()),
        gw.execute(read(&store, "c"), ExecuteOptions::keyed("c").batchable()),
    );

    assert_eq!(a.unwrap(), json!(1));
    assert!(matches!(b.unwrap_err(), GatewayError::ExecutionFailed { .. }));
    assert_eq!(c.unwrap(), json!(3));

    let batching = gw.connection_metrics().await.batching;
    assert_eq!(batching.batches_flushed, 1);
    assert_eq!(batching.requests_batched, 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_reads_collapse() {
    let store = MemoryStore::new();
    store.set_latency(Duration::from_millis(50));
    store.insert("report", json!({"rows": 120}));
    let gw = gateway(GatewayConfig::default(), &store);

    let results = join_all(
        (0..10).map(|_| gw.execute_select::<Value, _, _>(read(&store, "report"), "report", None)),
    )
    .await;

    for result in results {
        assert_eq!(result.unwrap(), json!({"rows": 120}));
    }
    assert_eq!(store.stats().queries, 1);

    let metrics = gw.connection_metrics().await;
    assert_eq!(metrics.dedup.collapsed, 9);
    assert_eq!(metrics.dedup_in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let store = MemoryStore::new();
    store.insert("k", json!("ok"));
    store.fail_next_n(2, QueryError::Transient("connection reset".into()));
    let gw = gateway(
        GatewayConfig {
            max_retries: 3,
            ..Default::default()
        },
        &store,
    );

    let value: Value = gw
        .execute_select(read(&store, "k"), "k", None)
        .await
        .unwrap();
    assert_eq!(value, json!("ok"));

    let stats = store.stats();
    assert_eq!(stats.queries, 3);
    assert_eq!(stats.connection_resets, 2);
    assert!(gw
        .render_metrics()
        .unwrap()
        .contains("quotagate_retries_total 2"));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_original_error() {
    let store = MemoryStore::new();
    store.fail_next_n(3, QueryError::Transient("deadlock victim".into()));
    let gw = gateway(
        GatewayConfig {
            max_retries: 3,
            ..Default::default()
        },
        &store,
    );

    let err = gw
        .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
        .await
        .unwrap_err();
    match err {
        GatewayError::ExecutionFailed {
            key,
            attempts,
            source,
        } => {
            assert_eq!(key.as_deref(), Some("k"));
            assert_eq!(attempts, 3);
            assert_eq!(source, QueryError::Transient("deadlock victim".into()));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(gw.cache_metrics().entries, 0);
    assert_eq!(gw.connection_metrics().await.failed_queries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_budget_times_out() {
    let store = MemoryStore::new();
    store.set_latency(Duration::from_secs(10));
    let gw = gateway(
        GatewayConfig {
            max_connections: 1,
            min_connections: 1,
            acquire_timeout_ms: 100,
            enable_request_batching: false,
            ..Default::default()
        },
        &store,
    );

    let (slow, starved) = tokio::join!(
        gw.execute(read(&store, "a"), ExecuteOptions::new("scan")),
        gw.execute(read(&store, "b"), ExecuteOptions::new("scan")),
    );
    assert!(slow.is_ok());
    assert!(matches!(
        starved.unwrap_err(),
        GatewayError::PoolTimeout { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_init_from_file_runs_background_tasks() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "health_check_interval_ms = 1000\ncache_sweep_interval_ms = 1000\ncache_ttl_ms = 500"
    )
    .unwrap();
    let config = GatewayConfig::from_file(file.path()).unwrap();

    let store = MemoryStore::new();
    store.insert("k", json!(1));
    let gw = ExecutionGateway::init(config, collaborators(&store, 3)).unwrap();
    let _: Value = gw
        .execute_select(read(&store, "k"), "k", None)
        .await
        .unwrap();
    assert_eq!(gw.cache_metrics().entries, 1);

    let mut waited = 0;
    while (gw.health().is_none() || gw.cache_metrics().entries > 0) && waited < 10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        waited += 1;
    }
    assert!(gw.health().is_some());
    assert!(store.stats().pings >= 1);
    assert_eq!(gw.cache_metrics().entries, 0);

    gw.shutdown().await;
    let err = gw
        .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ShuttingDown));
}

#[tokio::test]
async fn test_write_runs_every_time() {
    let store = MemoryStore::new();
    let gw = gateway(GatewayConfig::default(), &store);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let writer = store.clone();
        gw.execute_write(
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let writer = writer.clone();
                async move { writer.write("k", json!(1)).await }
            },
            &["k"],
        )
        .await
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.stats().writes, 3);
}
