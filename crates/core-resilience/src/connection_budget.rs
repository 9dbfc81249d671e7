//! Connection budget: a resizable bound on concurrent physical executions
//!
//! A single-process gateway does not own real sockets; the store driver does.
//! What it can own is the number of queries allowed to be in flight against
//! the driver at once. The budget hands out [`ConnectionLease`]s, waits up to
//! `acquire_timeout` when every lease is taken, and can be grown or shrunk at
//! runtime without disturbing leases that are already held.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Configuration for the connection budget
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Maximum number of concurrent leases
    pub max_size: usize,
    /// Advertised minimum of warm connections (reported, not enforced)
    pub min_idle: usize,
    /// Advertised idle timeout of the underlying driver (reported, not enforced)
    pub idle_timeout: Option<Duration>,
    /// Timeout for acquiring a lease
    pub acquire_timeout: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            idle_timeout: Some(Duration::from_secs(300)), // 5 minutes
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BudgetInner {
    semaphore: Arc<Semaphore>,
    config: Mutex<BudgetConfig>,
    /// Permits that must be retired when leases come back (pending shrink)
    debt: AtomicUsize,
    active: AtomicUsize,
    waiting: AtomicUsize,
    peak_active: AtomicUsize,
    total_acquired: AtomicU64,
    timeouts: AtomicU64,
}

impl BudgetInner {
    fn retire_one(&self) -> bool {
        self.debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }
}

/// Resizable concurrency budget
///
/// # Example
/// ```
/// use quotagate_core_resilience::{BudgetConfig, ConnectionBudget};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let budget = ConnectionBudget::new(BudgetConfig { max_size: 2, ..Default::default() });
/// let lease = budget.acquire().await.unwrap();
/// assert_eq!(budget.stats().active, 1);
/// drop(lease);
/// assert_eq!(budget.stats().active, 0);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBudget {
    inner: Arc<BudgetInner>,
}

/// A held slot in the budget; returned when dropped
#[derive(Debug)]
pub struct ConnectionLease {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<BudgetInner>,
    acquired_at: Instant,
}

impl ConnectionLease {
    /// How long this lease has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(permit) = self.permit.take() {
            if self.inner.retire_one() {
                permit.forget();
            }
        }
    }
}

impl ConnectionBudget {
    /// Create a new budget
    pub fn new(config: BudgetConfig) -> Self {
        let max_size = config.max_size;
        Self {
            inner: Arc::new(BudgetInner {
                semaphore: Arc::new(Semaphore::new(max_size)),
                config: Mutex::new(config),
                debt: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                total_acquired: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Create a budget with default configuration
    pub fn new_default() -> Self {
        Self::new(BudgetConfig::default())
    }

    /// Acquire a lease, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<ConnectionLease, ResilienceError> {
        let timeout = self.inner.config.lock().acquire_timeout;

        self.inner.waiting.fetch_add(1, Ordering::AcqRel);
        let acquired =
            tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned()).await;
        self.inner.waiting.fetch_sub(1, Ordering::AcqRel);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ResilienceError::BudgetClosed),
            Err(_) => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ResilienceError::BudgetExhausted(timeout));
            }
        };

        let active = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak_active.fetch_max(active, Ordering::AcqRel);
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionLease {
            permit: Some(permit),
            inner: self.inner.clone(),
            acquired_at: Instant::now(),
        })
    }

    /// Change the maximum number of concurrent leases.
    ///
    /// Growing adds permits immediately. Shrinking retires idle permits now and
    /// the remainder as outstanding leases are dropped.
    pub fn resize(&self, new_max: usize) {
        let mut config = self.inner.config.lock();
        let old_max = config.max_size;
        config.max_size = new_max;

        if new_max > old_max {
            let mut grow = new_max - old_max;
            while grow > 0 && self.inner.retire_one() {
                grow -= 1;
            }
            if grow > 0 {
                self.inner.semaphore.add_permits(grow);
            }
        } else if new_max < old_max {
            let shrink = old_max - new_max;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            self.inner
                .debt
                .fetch_add(shrink - forgotten, Ordering::AcqRel);
        }

        tracing::debug!(old_max, new_max, "connection budget resized");
    }

    /// Update the acquire timeout used by subsequent acquisitions
    pub fn set_acquire_timeout(&self, timeout: Duration) {
        self.inner.config.lock().acquire_timeout = timeout;
    }

    /// Update the advisory fields
    pub fn set_advisory(&self, min_idle: usize, idle_timeout: Option<Duration>) {
        let mut config = self.inner.config.lock();
        config.min_idle = min_idle;
        config.idle_timeout = idle_timeout;
    }

    /// Reject all current and future waiters
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    /// Get current budget statistics
    pub fn stats(&self) -> BudgetStats {
        let config = self.inner.config.lock().clone();
        BudgetStats {
            active: self.inner.active.load(Ordering::Acquire),
            waiting: self.inner.waiting.load(Ordering::Acquire),
            peak_active: self.inner.peak_active.load(Ordering::Acquire),
            total_acquired: self.inner.total_acquired.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            max_size: config.max_size,
            min_idle: config.min_idle,
            idle_timeout: config.idle_timeout,
            acquire_timeout: config.acquire_timeout,
        }
    }
}

/// Budget statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetStats {
    /// Leases currently held
    pub active: usize,
    /// Callers currently waiting for a lease
    pub waiting: usize,
    /// Highest concurrent lease count observed
    pub peak_active: usize,
    /// Leases handed out since creation
    pub total_acquired: u64,
    /// Acquisitions that gave up after the timeout
    pub timeouts: u64,
    /// Maximum budget size
    pub max_size: usize,
    pub min_idle: usize,
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
}

impl BudgetStats {
    /// Get budget utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active as f64 / self.max_size as f64) * 100.0
        }
    }
}
