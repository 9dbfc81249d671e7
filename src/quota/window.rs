//! Sliding transfer window.
//!
//! Accumulates estimated megabytes over a fixed-length window. The window
//! rolls (resets to zero) once `now - window_start` strictly exceeds the
//! window duration.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TransferWindow {
    window_start: Instant,
    duration: Duration,
    accumulated_mb: f64,
    max_mb: f64,
}

impl TransferWindow {
    pub fn new(max_mb: f64, duration: Duration, now: Instant) -> Self {
        Self {
            window_start: now,
            duration,
            accumulated_mb: 0.0,
            max_mb,
        }
    }

    /// Reset the window if its duration has elapsed. Returns true on rollover.
    pub fn roll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.duration {
            self.reset(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.accumulated_mb = 0.0;
    }

    /// Add to the current window. Negative and non-finite amounts are ignored.
    pub fn record(&mut self, mb: f64) {
        if mb.is_finite() && mb > 0.0 {
            self.accumulated_mb += mb;
        }
    }

    pub fn accumulated_mb(&self) -> f64 {
        self.accumulated_mb
    }

    pub fn max_mb(&self) -> f64 {
        self.max_mb
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_exhausted(&self) -> bool {
        self.accumulated_mb >= self.max_mb
    }

    pub fn utilization_pct(&self) -> f64 {
        if self.max_mb <= 0.0 {
            return 100.0;
        }
        self.accumulated_mb / self.max_mb * 100.0
    }

    /// Time until the window rolls over
    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// Apply new limits; the accumulated amount is kept.
    pub fn set_limits(&mut self, max_mb: f64, duration: Duration) {
        self.max_mb = max_mb;
        self.duration = duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_utilization() {
        let now = Instant::now();
        let mut window = TransferWindow::new(100.0, Duration::from_secs(300), now);

        window.record(40.0);
        window.record(5.0);
        assert_eq!(window.accumulated_mb(), 45.0);
        assert!((window.utilization_pct() - 45.0).abs() < f64::EPSILON);
        assert!(!window.is_exhausted());

        window.record(55.0);
        assert!(window.is_exhausted());
    }

    #[test]
    fn test_ignores_invalid_amounts() {
        let mut window = TransferWindow::new(10.0, Duration::from_secs(1), Instant::now());
        window.record(-3.0);
        window.record(f64::NAN);
        window.record(f64::INFINITY);
        assert_eq!(window.accumulated_mb(), 0.0);
    }

    #[test]
    fn test_rolls_only_after_duration_elapsed() {
        let start = Instant::now();
        let duration = Duration::from_secs(300);
        let mut window = TransferWindow::new(100.0, duration, start);
        window.record(60.0);

        assert!(!window.roll(start + duration));
        assert_eq!(window.accumulated_mb(), 60.0);

        assert!(window.roll(start + duration + Duration::from_millis(1)));
        assert_eq!(window.accumulated_mb(), 0.0);
        assert_eq!(window.remaining(start + duration + Duration::from_millis(1)), duration);
    }

    #[test]
    fn test_remaining_counts_down() {
        let start = Instant::now();
        let window = TransferWindow::new(1.0, Duration::from_secs(10), start);
        assert_eq!(window.remaining(start + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(window.remaining(start + Duration::from_secs(40)), Duration::ZERO);
    }

    #[test]
    fn test_set_limits_keeps_accumulated() {
        let mut window = TransferWindow::new(100.0, Duration::from_secs(60), Instant::now());
        window.record(50.0);
        window.set_limits(50.0, Duration::from_secs(30));
        assert!(window.is_exhausted());
        assert_eq!(window.duration(), Duration::from_secs(30));
    }
}
