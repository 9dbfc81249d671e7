//! In-flight query deduplication.
//!
//! When several callers ask for the same key at the same time, only the
//! first one (the leader) runs the query; the others subscribe to its
//! outcome and receive the same value or the same error.
//!
//! ```text
//! caller A ─┐
//!           │                       spawned task
//! caller B ─┼──► QueryDeduplicator ─────────────► store
//!           │         │                              │
//! caller C ─┘         ▼                              ▼
//!              [A, B, C receive ◄──────────── one execution]
//!               the same outcome]
//! ```
//!
//! The leader's work is spawned onto the runtime, so it completes (and frees
//! the key) even if every caller is cancelled. A panic in the shared work
//! settles all callers with an execution failure.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::SharedValue;
use crate::error::{GatewayError, QueryError};

type SharedOutcome = Result<SharedValue, GatewayError>;

/// Statistics for monitoring deduplication effectiveness
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Total requests received
    pub total: u64,
    /// Requests that joined an execution already in flight
    pub collapsed: u64,
    /// Requests that started a new execution
    pub leaders: u64,
}

impl DedupStats {
    /// Fraction of requests that were collapsed (0.0 to 1.0)
    pub fn collapse_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.collapsed as f64 / self.total as f64
        }
    }
}

pub struct QueryDeduplicator {
    in_flight: Arc<DashMap<String, broadcast::Sender<SharedOutcome>>>,
    total: AtomicU64,
    collapsed: AtomicU64,
    leaders: AtomicU64,
}

impl QueryDeduplicator {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            total: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
        }
    }

    /// Run `factory` unless an execution for `key` is already in flight, in
    /// which case wait for that execution's outcome instead.
    pub async fn run_deduplicated<T, F, Fut>(&self, key: &str, factory: F) -> Result<T, GatewayError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut rx = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.collapsed.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Joining in-flight query");
                entry.get().subscribe()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                self.leaders.fetch_add(1, Ordering::Relaxed);
                debug!(key, in_flight = self.in_flight.len(), "Starting shared query");
                self.spawn_shared(key.to_string(), tx, factory());
                rx
            }
        };

        match rx.recv().await {
            Ok(Ok(shared)) => shared.downcast_ref::<T>().cloned().ok_or_else(|| {
                GatewayError::Validation(format!(
                    "deduplicated key {} produced a value of a different type",
                    key
                ))
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::ExecutionFailed {
                key: Some(key.to_string()),
                attempts: 0,
                source: QueryError::Permanent("shared execution ended without a result".into()),
            }),
        }
    }

    fn spawn_shared<T, Fut>(&self, key: String, tx: broadcast::Sender<SharedOutcome>, work: Fut)
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let outcome: SharedOutcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => Ok(Arc::new(value) as SharedValue),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    warn!(key = %key, "Shared query panicked");
                    Err(GatewayError::ExecutionFailed {
                        key: Some(key.clone()),
                        attempts: 1,
                        source: QueryError::Permanent("query panicked".into()),
                    })
                }
            };

            // Free the key before notifying so a caller arriving after this
            // point starts a fresh execution.
            in_flight.remove(&key);
            let waiters = tx.receiver_count();
            let _ = tx.send(outcome);
            debug!(key = %key, waiters, "Shared query settled");
        });
    }

    /// Number of keys with an execution in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total: self.total.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
            leaders: self.leaders.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueryDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}
