//! Rolling execution metrics and the connection metrics snapshot.

use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::time::Duration;

use quotagate_core_resilience::{BreakerMetrics, BudgetStats, HealthStatus};

use crate::batcher::BatchStats;
use crate::dedup::DedupStats;

/// Number of recent executions the rolling window remembers
const ROLLING_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    success: bool,
}

/// Latency and success rate over the most recent executions
#[derive(Debug)]
pub(crate) struct RollingMetrics {
    samples: VecDeque<Sample>,
    capacity: usize,
    total: u64,
    failed: u64,
}

impl RollingMetrics {
    pub fn new() -> Self {
        Self::with_capacity(ROLLING_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, latency: Duration, success: bool) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { latency, success });
        self.total += 1;
        if !success {
            self.failed += 1;
        }
    }

    /// Failure rate of the recent window (0.0 - 1.0)
    pub fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failed = self.samples.iter().filter(|s| !s.success).count();
        failed as f64 / self.samples.len() as f64
    }

    pub fn avg_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().map(|s| s.latency).sum();
        sum / self.samples.len() as u32
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

/// Breaker state as reported in metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSummary {
    pub state: &'static str,
    pub consecutive_failures: usize,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub slow_call_rate: f64,
}

impl From<&BreakerMetrics> for BreakerSummary {
    fn from(m: &BreakerMetrics) -> Self {
        Self {
            state: m.state.label(),
            consecutive_failures: m.consecutive_failures,
            total_calls: m.total_calls,
            failed_calls: m.failed_calls,
            rejected_calls: m.rejected_calls,
            slow_call_rate: m.slow_call_rate,
        }
    }
}

/// Connection, execution and health figures of a gateway
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub active: usize,
    pub waiting: usize,
    pub max_connections: usize,
    /// Advisory; reported as configured
    pub min_connections: usize,
    /// Advisory; reported as configured
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
    pub peak_active: usize,
    pub total_acquired: u64,
    pub acquire_timeouts: u64,
    pub utilization: f64,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub failure_rate: f64,
    pub avg_latency: Duration,
    #[serde(serialize_with = "as_display")]
    pub health: HealthStatus,
    pub breaker: BreakerSummary,
    pub dedup: DedupStats,
    pub dedup_in_flight: usize,
    pub batching: BatchStats,
}

fn as_display<S: Serializer>(status: &HealthStatus, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(status)
}

impl ConnectionMetrics {
    pub(crate) fn assemble(
        budget: BudgetStats,
        rolling: &RollingMetrics,
        health: HealthStatus,
        breaker: &BreakerMetrics,
        dedup: DedupStats,
        dedup_in_flight: usize,
        batching: BatchStats,
    ) -> Self {
        Self {
            active: budget.active,
            waiting: budget.waiting,
            max_connections: budget.max_size,
            min_connections: budget.min_idle,
            idle_timeout: budget.idle_timeout,
            acquire_timeout: budget.acquire_timeout,
            peak_active: budget.peak_active,
            total_acquired: budget.total_acquired,
            acquire_timeouts: budget.timeouts,
            utilization: budget.utilization(),
            total_queries: rolling.total(),
            failed_queries: rolling.failed(),
            failure_rate: rolling.failure_rate(),
            avg_latency: rolling.avg_latency(),
            health,
            breaker: BreakerSummary::from(breaker),
            dedup,
            dedup_in_flight,
            batching,
        }
    }
}
