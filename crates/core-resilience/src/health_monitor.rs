//! Health Monitor: classifies store health from periodic probe samples
//!
//! The monitor is a pure-logic state machine. The caller runs the actual
//! liveness probe, gathers its rolling query metrics and the breaker state,
//! and feeds them in as a [`HealthSample`]. The monitor answers with a
//! [`HealthReport`]: an overall [`HealthStatus`] plus typed advisories.
//!
//! # Classification
//!
//! - **Healthy**: failure rate <= 5% and latency <= 2s
//! - **Degraded**: either exceeds the healthy bound, but failure rate <= 10%
//!   and latency <= 5s
//! - **Critical**: anything worse, a failed probe, or an open breaker
//!
//! # Example
//!
//! ```
//! use quotagate_core_resilience::health_monitor::{HealthMonitor, HealthSample, HealthConfig, HealthStatus};
//! use std::time::Duration;
//!
//! let mut monitor = HealthMonitor::new(HealthConfig::default());
//!
//! let report = monitor.check(HealthSample {
//!     failure_rate: 0.07,
//!     avg_latency: Duration::from_millis(300),
//!     probe_latency: Some(Duration::from_millis(20)),
//!     ..Default::default()
//! });
//!
//! assert_eq!(report.status, HealthStatus::Degraded);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for health classification thresholds
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Highest failure rate (0.0 - 1.0) still considered healthy
    pub healthy_failure_rate: f64,

    /// Highest average latency still considered healthy
    pub healthy_latency: Duration,

    /// Highest failure rate still considered degraded rather than critical
    pub degraded_failure_rate: f64,

    /// Highest average latency still considered degraded rather than critical
    pub degraded_latency: Duration,

    /// How often checks should be performed (guidance for the caller)
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_failure_rate: 0.05,
            healthy_latency: Duration::from_secs(2),
            degraded_failure_rate: 0.10,
            degraded_latency: Duration::from_secs(5),
            check_interval: Duration::from_secs(30),
        }
    }
}

/// A snapshot of store health inputs
#[derive(Debug, Clone, Default)]
pub struct HealthSample {
    /// Rolling failure rate of gateway executions (0.0 - 1.0)
    pub failure_rate: f64,

    /// Rolling average latency of gateway executions
    pub avg_latency: Duration,

    /// Latency of the liveness probe, `None` if the probe failed or timed out
    pub probe_latency: Option<Duration>,

    /// Whether the circuit breaker currently reports open
    pub breaker_open: bool,
}

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Advisory produced by the health monitor
#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    /// Breaker is open; the store is being shielded
    BreakerOpen,

    /// Liveness probe failed or timed out
    ProbeFailed,

    /// Failure rate is above the healthy bound
    FailureRateHigh { rate: f64, limit: f64 },

    /// Latency is above the healthy bound
    LatencyHigh { latency: Duration, limit: Duration },

    /// Probe latency more than doubled against its recent average
    ProbeLatencyRising { current: Duration, average: Duration },

    /// System is healthy, no issues detected
    Healthy,
}

/// Result of a single health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub advisories: Vec<Advisory>,
    /// Larger of the rolling average and the probe latency
    pub effective_latency: Duration,
    pub checked_at: Instant,
}

/// Health monitor that classifies samples and tracks probe latency history.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    /// Recent successful probe latencies for trending
    probe_history: VecDeque<Duration>,
    /// Maximum samples to keep for trending
    max_history: usize,
    /// Total checks performed
    check_count: u64,
    /// Total advisories produced (excluding Healthy)
    advisory_count: u64,
    last_report: Option<HealthReport>,
}

impl HealthMonitor {
    /// Create a new health monitor with the given configuration
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            probe_history: VecDeque::with_capacity(32),
            max_history: 30,
            check_count: 0,
            advisory_count: 0,
            last_report: None,
        }
    }

    /// Classify a health sample.
    pub fn check(&mut self, sample: HealthSample) -> HealthReport {
        self.check_count += 1;
        let mut advisories = Vec::new();

        let effective_latency = sample
            .probe_latency
            .map_or(sample.avg_latency, |probe| probe.max(sample.avg_latency));

        if sample.breaker_open {
            advisories.push(Advisory::BreakerOpen);
        }

        match sample.probe_latency {
            Some(latency) => {
                if let Some(average) = self.probe_average() {
                    if self.probe_history.len() >= 3 && latency > average * 2 {
                        advisories.push(Advisory::ProbeLatencyRising {
                            current: latency,
                            average,
                        });
                    }
                }
                self.probe_history.push_back(latency);
                while self.probe_history.len() > self.max_history {
                    self.probe_history.pop_front();
                }
            }
            None => advisories.push(Advisory::ProbeFailed),
        }

        if sample.failure_rate > self.config.healthy_failure_rate {
            advisories.push(Advisory::FailureRateHigh {
                rate: sample.failure_rate,
                limit: self.config.healthy_failure_rate,
            });
        }

        if effective_latency > self.config.healthy_latency {
            advisories.push(Advisory::LatencyHigh {
                latency: effective_latency,
                limit: self.config.healthy_latency,
            });
        }

        let status = self.classify(&sample, effective_latency);

        if advisories.is_empty() {
            advisories.push(Advisory::Healthy);
        } else {
            self.advisory_count += advisories.len() as u64;
        }

        let report = HealthReport {
            status,
            advisories,
            effective_latency,
            checked_at: Instant::now(),
        };
        self.last_report = Some(report.clone());
        report
    }

    fn classify(&self, sample: &HealthSample, latency: Duration) -> HealthStatus {
        if sample.breaker_open || sample.probe_latency.is_none() {
            return HealthStatus::Critical;
        }

        if sample.failure_rate <= self.config.healthy_failure_rate
            && latency <= self.config.healthy_latency
        {
            HealthStatus::Healthy
        } else if sample.failure_rate <= self.config.degraded_failure_rate
            && latency <= self.config.degraded_latency
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    /// Mean of the recorded probe latencies
    fn probe_average(&self) -> Option<Duration> {
        if self.probe_history.is_empty() {
            return None;
        }
        let total: Duration = self.probe_history.iter().sum();
        Some(total / self.probe_history.len() as u32)
    }

    /// The most recent report, if any check has run
    pub fn last_report(&self) -> Option<&HealthReport> {
        self.last_report.as_ref()
    }

    /// Get monitoring statistics
    pub fn stats(&self) -> HealthMonitorStats {
        HealthMonitorStats {
            check_count: self.check_count,
            advisory_count: self.advisory_count,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }
}

/// Statistics for the health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitorStats {
    /// Total health checks performed
    pub check_count: u64,
    /// Total advisories produced (excluding Healthy)
    pub advisory_count: u64,
}
