//! Bounded alert log.
//!
//! Alerts are kept oldest-first and dropped when the log exceeds its
//! capacity or an alert grows older than the maximum age.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
            AlertLevel::Emergency => write!(f, "emergency"),
        }
    }
}

/// Quota figures at the time an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub used_mb: f64,
    pub max_mb: f64,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot: QuotaSnapshot,
    pub recommendations: Vec<String>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>, snapshot: QuotaSnapshot) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            snapshot,
            recommendations: Vec::new(),
        }
    }

    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }
}

#[derive(Debug)]
pub struct AlertLog {
    entries: VecDeque<Alert>,
    capacity: usize,
    max_age: chrono::Duration,
    total_recorded: u64,
    total_dropped: u64,
}

impl AlertLog {
    pub fn new(capacity: usize, max_age: std::time::Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(128)),
            capacity: capacity.max(1),
            max_age: to_chrono(max_age),
            total_recorded: 0,
            total_dropped: 0,
        }
    }

    /// Record an alert, dropping the oldest entries past capacity or age
    pub fn push(&mut self, alert: Alert) {
        self.total_recorded += 1;
        let now = alert.timestamp;
        self.entries.push_back(alert);
        self.prune(now);
    }

    /// Drop entries past capacity or older than the maximum age at `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.total_dropped += 1;
        }
        while let Some(front) = self.entries.front() {
            if now.signed_duration_since(front.timestamp) > self.max_age {
                self.entries.pop_front();
                self.total_dropped += 1;
            } else {
                break;
            }
        }
    }

    pub fn set_bounds(&mut self, capacity: usize, max_age: std::time::Duration) {
        self.capacity = capacity.max(1);
        self.max_age = to_chrono(max_age);
        self.prune(Utc::now());
    }

    /// Most recent alerts, newest last
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
