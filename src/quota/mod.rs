//! Transfer quota tracking.
//!
//! [`QuotaTracker`] accounts the estimated data transferred from the store
//! over a sliding window and decides whether a new query is admitted,
//! probabilistically throttled or denied. It also owns the emergency
//! controller, which locks out all traffic under extreme pressure until
//! utilization has recovered for a sustained period, and the alert log.
//!
//! State changes that other components must react to (entering or leaving
//! emergency mode) are published as [`QuotaEvent`]s on a broadcast channel.

mod alerts;
mod emergency;
mod window;

pub use alerts::{Alert, AlertLevel, AlertLog, QuotaSnapshot};
pub use emergency::{EmergencyController, EmergencyState, Thresholds, Transition};
pub use window::TransferWindow;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, QuotaPolicy};
use crate::error::EstimationError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const EVENT_CHANNEL_CAPACITY: usize = 16;
const STATUS_ALERT_LIMIT: usize = 10;

/// Admission outcome for a single query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmitDecision {
    Allow,
    Throttle,
    Deny,
}

impl AdmitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmitDecision::Allow)
    }
}

impl fmt::Display for AdmitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitDecision::Allow => write!(f, "allow"),
            AdmitDecision::Throttle => write!(f, "throttle"),
            AdmitDecision::Deny => write!(f, "deny"),
        }
    }
}

/// Utilization band the tracker is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    Normal,
    Elevated,
    High,
    Exhausted,
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaTier::Normal => write!(f, "normal"),
            QuotaTier::Elevated => write!(f, "elevated"),
            QuotaTier::High => write!(f, "high"),
            QuotaTier::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Uniform random numbers in `[0, 1)` for throttling decisions.
///
/// Implemented for every [`rand::Rng`], so tests can inject a seeded
/// `StdRng` and get reproducible decisions.
pub trait RandomSource: Send {
    fn next_f64(&mut self) -> f64;
}

impl<R: rand::Rng + Send> RandomSource for R {
    fn next_f64(&mut self) -> f64 {
        self.random::<f64>()
    }
}

/// Protective measure applied by the gateway while in emergency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProtectiveAction {
    /// Multiply the cache TTL so cached results outlive the lockout
    ExtendCacheTtl { factor: u32 },
    /// Shrink the connection budget
    ReduceConnections { max_connections: usize },
    /// Open the circuit breaker proactively
    TripCircuitBreaker,
}

impl fmt::Display for ProtectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectiveAction::ExtendCacheTtl { factor } => {
                write!(f, "extend cache TTL by {}x", factor)
            }
            ProtectiveAction::ReduceConnections { max_connections } => {
                write!(f, "reduce connections to {}", max_connections)
            }
            ProtectiveAction::TripCircuitBreaker => write!(f, "trip circuit breaker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    EmergencyEntered { actions: Vec<ProtectiveAction> },
    EmergencyCleared,
}

/// Point-in-time view of the tracker
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub used_mb: f64,
    pub max_mb: f64,
    pub utilization_pct: f64,
    pub window_remaining: Duration,
    pub tier: QuotaTier,
    pub emergency: bool,
    pub emergency_for: Option<Duration>,
    pub emergency_activations: u64,
    pub admitted: u64,
    pub throttled: u64,
    pub denied: u64,
    pub recent_alerts: Vec<Alert>,
}

struct TrackerState {
    window: TransferWindow,
    emergency: EmergencyController,
    alerts: AlertLog,
    policy: QuotaPolicy,
    last_tier: QuotaTier,
    admitted: u64,
    throttled: u64,
    denied: u64,
}

impl TrackerState {
    fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            used_mb: self.window.accumulated_mb(),
            max_mb: self.window.max_mb(),
            utilization_pct: self.window.utilization_pct(),
        }
    }

    fn tier(&self) -> QuotaTier {
        let pct = self.window.utilization_pct();
        if self.window.is_exhausted() {
            QuotaTier::Exhausted
        } else if pct > self.policy.throttle_high_pct {
            QuotaTier::High
        } else if pct > self.policy.throttle_low_pct {
            QuotaTier::Elevated
        } else {
            QuotaTier::Normal
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            entry_pct: self.policy.emergency_entry_pct,
            recovery_pct: self.policy.emergency_recovery_pct,
            dwell: self.policy.emergency_dwell(),
        }
    }

    fn protective_actions(&self) -> Vec<ProtectiveAction> {
        vec![
            ProtectiveAction::ExtendCacheTtl {
                factor: self.policy.emergency_ttl_factor,
            },
            ProtectiveAction::ReduceConnections {
                max_connections: self.policy.emergency_max_connections,
            },
            ProtectiveAction::TripCircuitBreaker,
        ]
    }
}

/// Sliding-window transfer quota with tiered throttling and emergency lockout
pub struct QuotaTracker {
    state: Mutex<TrackerState>,
    random: Mutex<Box<dyn RandomSource>>,
    events: broadcast::Sender<QuotaEvent>,
}

impl QuotaTracker {
    /// Create a tracker with an OS-seeded random source
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_random(config, Box::new(StdRng::from_os_rng()))
    }

    pub fn with_random(config: &GatewayConfig, random: Box<dyn RandomSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let policy = config.quota.clone();
        let state = TrackerState {
            window: TransferWindow::new(
                config.max_data_transfer_mb,
                config.data_transfer_window(),
                Instant::now(),
            ),
            emergency: EmergencyController::new(),
            alerts: AlertLog::new(policy.alert_capacity, policy.alert_max_age()),
            policy,
            last_tier: QuotaTier::Normal,
            admitted: 0,
            throttled: 0,
            denied: 0,
        };

        Self {
            state: Mutex::new(state),
            random: Mutex::new(random),
            events,
        }
    }

    /// Decide whether a query may proceed.
    ///
    /// Emergency and an exhausted window deny outright and take precedence
    /// over the probabilistic tiers, which only apply below the cap.
    pub fn check_admit(&self) -> AdmitDecision {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.window.roll(now) {
            debug!("Transfer window rolled over during admission");
        }

        let decision = if state.emergency.is_active() || state.window.is_exhausted() {
            AdmitDecision::Deny
        } else {
            let probability = match state.tier() {
                QuotaTier::High => state.policy.throttle_high_probability,
                QuotaTier::Elevated => state.policy.throttle_low_probability,
                QuotaTier::Normal | QuotaTier::Exhausted => 0.0,
            };
            if probability > 0.0 && self.random.lock().next_f64() < probability {
                AdmitDecision::Throttle
            } else {
                AdmitDecision::Allow
            }
        };

        match decision {
            AdmitDecision::Allow => state.admitted += 1,
            AdmitDecision::Throttle => state.throttled += 1,
            AdmitDecision::Deny => state.denied += 1,
        }
        decision
    }

    /// Add an estimated transfer to the current window
    pub fn record_transfer(&self, mb: f64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.window.roll(now);
        state.window.record(mb);
    }

    /// Estimate the transfer size of a result and record it.
    ///
    /// Returns the recorded megabytes; an estimate that fails counts as zero.
    pub fn record_transfer_of<T: Serialize + ?Sized>(&self, value: &T) -> f64 {
        let mb = match estimate_mb(value) {
            Ok(mb) => mb,
            Err(e) => {
                debug!(error = %e, "Transfer estimate failed, counting as zero");
                0.0
            }
        };
        self.record_transfer(mb);
        mb
    }

    /// Reset the window and leave emergency mode
    pub fn force_reset(&self) {
        let now = Instant::now();
        let cleared = {
            let mut state = self.state.lock();
            state.window.reset(now);
            state.last_tier = QuotaTier::Normal;
            let cleared = state.emergency.force_clear();
            let alert = Alert::new(AlertLevel::Info, "Quota manually reset", state.snapshot());
            state.alerts.push(alert);
            cleared
        };

        info!(cleared_emergency = cleared, "Quota window force-reset");
        if cleared {
            self.publish(QuotaEvent::EmergencyCleared);
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.state.lock().emergency.is_active()
    }

    pub fn utilization_pct(&self) -> f64 {
        self.state.lock().window.utilization_pct()
    }

    pub fn status(&self) -> QuotaStatus {
        let now = Instant::now();
        let state = self.state.lock();
        QuotaStatus {
            used_mb: state.window.accumulated_mb(),
            max_mb: state.window.max_mb(),
            utilization_pct: state.window.utilization_pct(),
            window_remaining: state.window.remaining(now),
            tier: state.tier(),
            emergency: state.emergency.is_active(),
            emergency_for: state.emergency.active_for(now),
            emergency_activations: state.emergency.activations(),
            admitted: state.admitted,
            throttled: state.throttled,
            denied: state.denied,
            recent_alerts: state.alerts.recent(STATUS_ALERT_LIMIT),
        }
    }

    /// Periodic maintenance: roll the window, raise tier alerts and run the
    /// emergency state machine. Safe to call at any frequency.
    pub fn housekeeping(&self) -> Option<QuotaEvent> {
        self.housekeeping_at(Instant::now())
    }

    pub fn housekeeping_at(&self, now: Instant) -> Option<QuotaEvent> {
        let event = {
            let mut state = self.state.lock();
            if state.window.roll(now) {
                debug!("Transfer window rolled over");
            }

            state.alerts.prune(chrono::Utc::now());

            let tier = state.tier();
            if tier > state.last_tier {
                let snapshot = state.snapshot();
                let alert = match tier {
                    QuotaTier::Elevated => Some(Alert::new(
                        AlertLevel::Warning,
                        format!("Transfer quota at {:.1}%", snapshot.utilization_pct),
                        snapshot,
                    )),
                    QuotaTier::High | QuotaTier::Exhausted => Some(Alert::new(
                        AlertLevel::Critical,
                        format!("Transfer quota at {:.1}%", snapshot.utilization_pct),
                        snapshot,
                    )),
                    QuotaTier::Normal => None,
                };
                if let Some(alert) = alert {
                    warn!(
                        utilization_pct = snapshot.utilization_pct,
                        tier = %tier,
                        "Transfer quota pressure rising"
                    );
                    state.alerts.push(alert);
                }
            }
            state.last_tier = tier;

            let utilization = state.window.utilization_pct();
            let thresholds = state.thresholds();
            match state.emergency.evaluate(utilization, now, &thresholds) {
                Some(Transition::Entered) => {
                    let actions = state.protective_actions();
                    let alert = Alert::new(
                        AlertLevel::Emergency,
                        format!(
                            "Emergency quota protection engaged at {:.1}%",
                            utilization
                        ),
                        state.snapshot(),
                    )
                    .with_recommendations(actions.iter().map(|a| a.to_string()).collect());
                    state.alerts.push(alert);
                    error!(
                        utilization_pct = utilization,
                        "Entering emergency quota protection"
                    );
                    Some(QuotaEvent::EmergencyEntered { actions })
                }
                Some(Transition::Cleared) => {
                    let alert = Alert::new(
                        AlertLevel::Info,
                        "Emergency quota protection lifted",
                        state.snapshot(),
                    );
                    state.alerts.push(alert);
                    info!(utilization_pct = utilization, "Leaving emergency quota protection");
                    Some(QuotaEvent::EmergencyCleared)
                }
                None => None,
            }
        };

        if let Some(ref event) = event {
            self.publish(event.clone());
        }
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.events.subscribe()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.all()
    }

    /// Apply new window limits; usage already recorded is kept
    pub fn update_limits(&self, max_mb: f64, window: Duration) {
        self.state.lock().window.set_limits(max_mb, window);
    }

    pub fn set_policy(&self, policy: QuotaPolicy) {
        let mut state = self.state.lock();
        state
            .alerts
            .set_bounds(policy.alert_capacity, policy.alert_max_age());
        state.policy = policy;
    }

    fn publish(&self, event: QuotaEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QuotaTracker")
            .field("window", &state.window)
            .field("emergency", &state.emergency.is_active())
            .finish()
    }
}

/// JSON-serialized size of a value in megabytes
pub(crate) fn estimate_mb<T: Serialize + ?Sized>(value: &T) -> Result<f64, EstimationError> {
    let bytes = serde_json::to_vec(value)?.len();
    Ok(bytes as f64 / BYTES_PER_MB)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Random source that always returns the same value
    struct Fixed(f64);

    impl RandomSource for Fixed {
        fn next_f64(&mut self) -> f64 {
            self.0
        }
    }

    fn config(max_mb: f64) -> GatewayConfig {
        GatewayConfig {
            max_data_transfer_mb: max_mb,
            data_transfer_window_ms: 60_000,
            ..Default::default()
        }
    }

    fn tracker(max_mb: f64, random: f64) -> QuotaTracker {
        QuotaTracker::with_random(&config(max_mb), Box::new(Fixed(random)))
    }

    #[test]
    fn test_allows_below_tiers() {
        let tracker = tracker(100.0, 0.0);
        tracker.record_transfer(50.0);
        assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
    }

    #[test]
    fn test_tier_probabilities() {
        // 85%: low tier, probability 0.25
        let low = tracker(100.0, 0.2);
        low.record_transfer(85.0);
        assert_eq!(low.check_admit(), AdmitDecision::Throttle);

        let low = tracker(100.0, 0.3);
        low.record_transfer(85.0);
        assert_eq!(low.check_admit(), AdmitDecision::Allow);

        // 92%: high tier, probability 0.5
        let high = tracker(100.0, 0.45);
        high.record_transfer(92.0);
        assert_eq!(high.check_admit(), AdmitDecision::Throttle);

        let high = tracker(100.0, 0.55);
        high.record_transfer(92.0);
        assert_eq!(high.check_admit(), AdmitDecision::Allow);
    }

    #[test]
    fn test_denies_when_exhausted() {
        let tracker = tracker(10.0, 0.99);
        tracker.record_transfer(10.0);
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);
        assert_eq!(tracker.status().tier, QuotaTier::Exhausted);
        assert_eq!(tracker.status().denied, 1);
    }

    #[test]
    fn test_exhausted_window_denies_even_when_throttle_would_fire() {
        let tracker = tracker(10.0, 0.0);
        tracker.record_transfer(12.0);
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

        let status = tracker.status();
        assert_eq!(status.denied, 1);
        assert_eq!(status.throttled, 0);
    }

    #[test]
    fn test_seeded_random_throttles_about_half() {
        let tracker = QuotaTracker::with_random(&config(100.0), Box::new(StdRng::seed_from_u64(7)));
        tracker.record_transfer(95.0);

        let throttled = (0..1000)
            .filter(|_| tracker.check_admit() == AdmitDecision::Throttle)
            .count();
        assert!((400..=600).contains(&throttled), "throttled {}", throttled);
    }

    #[test]
    fn test_record_transfer_of_estimates_json_size() {
        let tracker = tracker(100.0, 0.0);
        let payload = vec![0u8; 1024];
        let mb = tracker.record_transfer_of(&payload);
        assert!(mb > 0.0);
        assert!((tracker.status().used_mb - mb).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimation_failure_counts_as_zero() {
        use std::collections::HashMap;

        // Non-string map keys cannot be encoded as JSON
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let tracker = tracker(100.0, 0.0);
        assert_eq!(tracker.record_transfer_of(&bad), 0.0);
        assert_eq!(tracker.status().used_mb, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_duration() {
        let tracker = tracker(100.0, 0.0);
        tracker.record_transfer(100.0);
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

        tokio::time::advance(Duration::from_millis(60_000)).await;
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
        assert_eq!(tracker.status().used_mb, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_lockout_and_recovery() {
        let tracker = tracker(100.0, 0.99);
        let mut events = tracker.subscribe();

        tracker.record_transfer(96.0);
        let entered = tracker.housekeeping();
        assert!(matches!(entered, Some(QuotaEvent::EmergencyEntered { .. })));
        assert!(tracker.is_emergency());
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

        match events.recv().await.unwrap() {
            QuotaEvent::EmergencyEntered { actions } => {
                assert!(actions.contains(&ProtectiveAction::TripCircuitBreaker));
                assert!(actions.contains(&ProtectiveAction::ExtendCacheTtl { factor: 4 }));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Window rolls (utilization 0%) but the dwell has not elapsed
        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(tracker.housekeeping().is_none());
        assert!(tracker.is_emergency());
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);

        tokio::time::advance(Duration::from_millis(300_000)).await;
        assert_eq!(tracker.housekeeping(), Some(QuotaEvent::EmergencyCleared));
        assert!(!tracker.is_emergency());
        assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
        assert_eq!(events.recv().await.unwrap(), QuotaEvent::EmergencyCleared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_not_entered_at_exactly_threshold() {
        let tracker = tracker(100.0, 0.99);
        tracker.record_transfer(95.0);
        assert!(tracker.housekeeping().is_none());
        assert!(!tracker.is_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reset_clears_everything() {
        let tracker = tracker(100.0, 0.0);
        let mut events = tracker.subscribe();
        tracker.record_transfer(99.0);
        tracker.housekeeping();
        assert!(tracker.is_emergency());
        let _ = events.recv().await;

        tracker.force_reset();
        assert!(!tracker.is_emergency());
        assert_eq!(tracker.utilization_pct(), 0.0);
        assert_eq!(tracker.check_admit(), AdmitDecision::Allow);
        assert_eq!(events.recv().await.unwrap(), QuotaEvent::EmergencyCleared);

        let last = tracker.alerts().pop().unwrap();
        assert_eq!(last.level, AlertLevel::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_alerts_raised_once_per_rise() {
        let tracker = tracker(100.0, 0.99);
        tracker.record_transfer(85.0);
        tracker.housekeeping();
        tracker.housekeeping();
        tracker.record_transfer(6.0);
        tracker.housekeeping();

        let levels: Vec<_> = tracker.alerts().into_iter().map(|a| a.level).collect();
        assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Critical]);
    }

    #[test]
    fn test_update_limits() {
        let tracker = tracker(100.0, 0.0);
        tracker.record_transfer(50.0);
        tracker.update_limits(50.0, Duration::from_secs(10));
        assert_eq!(tracker.check_admit(), AdmitDecision::Deny);
        assert!(tracker.status().window_remaining <= Duration::from_secs(10));
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(AdmitDecision::Allow.to_string(), "allow");
        assert_eq!(AdmitDecision::Throttle.to_string(), "throttle");
        assert_eq!(AdmitDecision::Deny.to_string(), "deny");
        assert!(AdmitDecision::Allow.is_allowed());
    }
}
