//! Circuit breaker in front of the backing store
//!
//! ```text
//!            failures >= threshold              cooldown elapsed
//!   Closed ─────────────────────────► Open ─────────────────────► HalfOpen
//!     ▲                                ▲ ▲                            │
//!     │          trip()                │ └──── any failure ───────────┤
//!     │  ──────────────────────────────┘                              │
//!     └──────────────── successes >= success_threshold ───────────────┘
//! ```
//!
//! One [`CircuitBreaker::call`] is one attempt. Retrying is left to the
//! caller, which also decides what counts as retryable.

use super::error::ResilienceError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Attempts pass through
    Closed,
    /// Attempts are rejected until `next_probe`
    Open { next_probe: Instant },
    /// Probing whether the store recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase label ("closed", "open", "half-open")
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    /// Whether the breaker is currently rejecting calls
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: usize,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: usize,
    /// Time spent open before a half-open probe is admitted
    pub cooldown: Duration,
    /// Attempts slower than this count towards the slow-call rate
    pub slow_call_threshold: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
            slow_call_threshold: Duration::from_secs(2),
        }
    }
}

/// Point-in-time view of breaker counters
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub slow_calls: u64,
    /// Fraction (0.0 - 1.0) of completed calls slower than the threshold
    pub slow_call_rate: f64,
}

#[derive(Debug)]
struct Tracker {
    state: CircuitState,
    failures: usize,
    probe_successes: usize,
    total: u64,
    failed: u64,
    rejected: u64,
    slow: u64,
}

impl Tracker {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            probe_successes: 0,
            total: 0,
            failed: 0,
            rejected: 0,
            slow: 0,
        }
    }

    fn open(&mut self, cooldown: Duration) {
        self.state = CircuitState::Open {
            next_probe: Instant::now() + cooldown,
        };
        self.failures = 0;
        self.probe_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.probe_successes = 0;
    }
}

/// Circuit breaker shared by every execution against one store
///
/// # Example
/// ```no_run
/// use quotagate_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
/// let rows = breaker
///     .call(|| async { Ok::<_, ResilienceError>(vec!["row"]) })
///     .await?;
/// assert_eq!(rows.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    tracker: Arc<Mutex<Tracker>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            tracker: Arc::new(Mutex::new(Tracker::closed())),
        }
    }

    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub async fn get_state(&self) -> CircuitState {
        self.tracker.lock().await.state
    }

    /// Consecutive failures counted while closed
    pub async fn get_failure_count(&self) -> usize {
        self.tracker.lock().await.failures
    }

    /// True while the circuit is closed
    pub async fn is_healthy(&self) -> bool {
        self.get_state().await == CircuitState::Closed
    }

    /// Close the circuit and forget consecutive counts
    pub async fn reset(&self) {
        self.tracker.lock().await.close();
        tracing::debug!("circuit breaker reset");
    }

    /// Open the circuit now, whatever the failure count.
    ///
    /// The usual cooldown applies before a half-open probe is allowed.
    pub async fn trip(&self) {
        self.tracker.lock().await.open(self.config.cooldown);
        tracing::warn!(cooldown = ?self.config.cooldown, "circuit breaker tripped");
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let t = self.tracker.lock().await;
        BreakerMetrics {
            state: t.state,
            consecutive_failures: t.failures,
            total_calls: t.total,
            failed_calls: t.failed,
            rejected_calls: t.rejected,
            slow_calls: t.slow,
            slow_call_rate: if t.total == 0 {
                0.0
            } else {
                t.slow as f64 / t.total as f64
            },
        }
    }

    /// Run one attempt under breaker protection.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without running `op` while
    /// the circuit is open and the cooldown has not elapsed.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.admit().await?;

        let started = Instant::now();
        let outcome = op().await;
        self.record(outcome.as_ref().err(), started.elapsed()).await;
        outcome
    }

    async fn admit(&self) -> Result<(), ResilienceError> {
        let mut t = self.tracker.lock().await;
        if let CircuitState::Open { next_probe } = t.state {
            if Instant::now() < next_probe {
                t.rejected += 1;
                return Err(ResilienceError::CircuitOpen);
            }
            t.state = CircuitState::HalfOpen;
            t.probe_successes = 0;
            tracing::debug!("circuit breaker half-open, probing store");
        }
        Ok(())
    }

    async fn record(&self, error: Option<&ResilienceError>, elapsed: Duration) {
        let mut t = self.tracker.lock().await;
        t.total += 1;
        if elapsed > self.config.slow_call_threshold {
            t.slow += 1;
        }

        let Some(error) = error else {
            match t.state {
                CircuitState::Closed => t.failures = 0,
                CircuitState::HalfOpen => {
                    t.probe_successes += 1;
                    if t.probe_successes >= self.config.success_threshold {
                        t.close();
                        tracing::info!("circuit breaker closed after successful probes");
                    }
                }
                // Admitted before a trip; the trip stands
                CircuitState::Open { .. } => {}
            }
            return;
        };

        t.failed += 1;
        if !error.should_trip_breaker() {
            return;
        }
        match t.state {
            CircuitState::Closed => {
                t.failures += 1;
                if t.failures >= self.config.failure_threshold {
                    t.open(self.config.cooldown);
                    tracing::warn!(
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                t.open(self.config.cooldown);
                tracing::warn!(error = %error, "half-open probe failed, circuit reopened");
            }
            CircuitState::Open { .. } => {}
        }
    }
}
