//! Storage collaborator.
//!
//! The gateway never speaks a query language itself; it wraps caller-provided
//! operations. It does need two hooks from the store driver: dropping cached
//! connections between retry attempts, and a cheap liveness probe.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;

/// Hooks the gateway needs from the store driver
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Drop any cached/pooled connections so the next attempt reconnects
    async fn clear_connection_cache(&self);

    /// Cheap round-trip used by the health probe
    async fn ping(&self) -> Result<(), QueryError>;
}

/// In-memory store with injectable latency and failures.
///
/// Backs the CLI simulator and tests.
///
/// # Example
///
/// ```rust
/// use quotagate::store::MemoryStore;
/// use serde_json::json;
///
/// # tokio_test_block(async {
/// let store = MemoryStore::new();
/// store.insert("orders:1", json!({"qty": 3}));
/// assert_eq!(store.query("orders:1").await.unwrap(), json!({"qty": 3}));
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<HashMap<String, Value>>>,
    faults: Arc<Mutex<Faults>>,
    counters: Arc<StoreCounters>,
}

#[derive(Debug, Default)]
struct Faults {
    latency: Duration,
    /// Errors returned by the next queries, in order
    queued: VecDeque<QueryError>,
    ping_failure: Option<QueryError>,
}

#[derive(Debug, Default)]
struct StoreCounters {
    queries: AtomicU64,
    writes: AtomicU64,
    connection_resets: AtomicU64,
    pings: AtomicU64,
}

/// Counters observed by tests and the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub queries: u64,
    pub writes: u64,
    pub connection_resets: u64,
    pub pings: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.rows.write().insert(key.into(), value);
    }

    /// Simulated latency applied to every query, write and ping
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    /// Make the next query fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: QueryError) {
        self.faults.lock().queued.push_back(error);
    }

    /// Make the next `n` queries fail with `error`
    pub fn fail_next_n(&self, n: usize, error: QueryError) {
        let mut faults = self.faults.lock();
        for _ in 0..n {
            faults.queued.push_back(error.clone());
        }
    }

    /// Make pings fail until cleared with `None`
    pub fn set_ping_failure(&self, error: Option<QueryError>) {
        self.faults.lock().ping_failure = error;
    }

    /// Read a row. Missing rows read as `null`.
    pub async fn query(&self, key: &str) -> Result<Value, QueryError> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.delay_then_fault().await?;
        Ok(self.rows.read().get(key).cloned().unwrap_or(Value::Null))
    }

    /// Read every row whose key starts with `prefix`
    pub async fn scan(&self, prefix: &str) -> Result<Vec<Value>, QueryError> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.delay_then_fault().await?;
        let rows = self.rows.read();
        let mut keys: Vec<&String> = rows.keys().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();
        Ok(keys.into_iter().filter_map(|k| rows.get(k).cloned()).collect())
    }

    pub async fn write(&self, key: &str, value: Value) -> Result<(), QueryError> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.delay_then_fault().await?;
        self.rows.write().insert(key.to_string(), value);
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            queries: self.counters.queries.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            connection_resets: self.counters.connection_resets.load(Ordering::Relaxed),
            pings: self.counters.pings.load(Ordering::Relaxed),
        }
    }

    async fn delay_then_fault(&self) -> Result<(), QueryError> {
        let (latency, fault) = {
            let mut faults = self.faults.lock();
            (faults.latency, faults.queued.pop_front())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn clear_connection_cache(&self) {
        self.counters.connection_resets.fetch_add(1, Ordering::Relaxed);
    }

    async fn ping(&self) -> Result<(), QueryError> {
        self.counters.pings.fetch_add(1, Ordering::Relaxed);
        let (latency, failure) = {
            let faults = self.faults.lock();
            (faults.latency, faults.ping_failure.clone())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_and_write() {
        let store = MemoryStore::new();
        store.insert("a", json!(1));
        assert_eq!(store.query("a").await.unwrap(), json!(1));
        assert_eq!(store.query("missing").await.unwrap(), Value::Null);

        store.write("b", json!("two")).await.unwrap();
        assert_eq!(store.query("b").await.unwrap(), json!("two"));

        let stats = store.stats();
        assert_eq!(stats.queries, 3);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_scan_sorted_by_key() {
        let store = MemoryStore::new();
        store.insert("pos:2", json!(2));
        store.insert("pos:1", json!(1));
        store.insert("ord:1", json!(9));
        assert_eq!(store.scan("pos:").await.unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_fault_injection_is_ordered() {
        let store = MemoryStore::new();
        store.fail_next(QueryError::Transient("reset".into()));
        store.fail_next(QueryError::Permanent("syntax".into()));

        assert!(matches!(store.query("x").await, Err(QueryError::Transient(_))));
        assert!(matches!(store.query("x").await, Err(QueryError::Permanent(_))));
        assert!(store.query("x").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_ping() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        store.ping().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));

        store.set_ping_failure(Some(QueryError::Transient("down".into())));
        assert!(store.ping().await.is_err());
        store.clear_connection_cache().await;

        let stats = store.stats();
        assert_eq!(stats.pings, 2);
        assert_eq!(stats.connection_resets, 1);
    }
}
