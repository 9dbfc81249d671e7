//! Emergency protection state machine.
//!
//! ```text
//!            utilization > entry
//!   Normal ──────────────────────▶ Emergency { entered_at, dwell_armed_at }
//!     ▲                                 │
//!     │  dwell elapsed AND              │ dwell elapsed, still >= recovery
//!     │  utilization < recovery         ▼
//!     └──────────────────────────── re-arm dwell
//! ```
//!
//! Transitions happen only from [`EmergencyController::evaluate`] (driven by
//! quota housekeeping) and [`EmergencyController::force_clear`].

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmergencyState {
    #[default]
    Normal,
    Emergency {
        entered_at: Instant,
        dwell_armed_at: Instant,
    },
}

/// Outcome of an evaluation that changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Cleared,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub entry_pct: f64,
    pub recovery_pct: f64,
    pub dwell: Duration,
}

#[derive(Debug, Default)]
pub struct EmergencyController {
    state: EmergencyState,
    activations: u64,
}

impl EmergencyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, EmergencyState::Emergency { .. })
    }

    /// How long emergency mode has been active
    pub fn active_for(&self, now: Instant) -> Option<Duration> {
        match self.state {
            EmergencyState::Normal => None,
            EmergencyState::Emergency { entered_at, .. } => {
                Some(now.saturating_duration_since(entered_at))
            }
        }
    }

    /// Number of times emergency mode was entered
    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn evaluate(
        &mut self,
        utilization_pct: f64,
        now: Instant,
        thresholds: &Thresholds,
    ) -> Option<Transition> {
        match self.state {
            EmergencyState::Normal => {
                if utilization_pct > thresholds.entry_pct {
                    self.state = EmergencyState::Emergency {
                        entered_at: now,
                        dwell_armed_at: now,
                    };
                    self.activations += 1;
                    Some(Transition::Entered)
                } else {
                    None
                }
            }
            EmergencyState::Emergency {
                entered_at,
                dwell_armed_at,
            } => {
                if now.saturating_duration_since(dwell_armed_at) < thresholds.dwell {
                    return None;
                }
                if utilization_pct < thresholds.recovery_pct {
                    self.state = EmergencyState::Normal;
                    Some(Transition::Cleared)
                } else {
                    self.state = EmergencyState::Emergency {
                        entered_at,
                        dwell_armed_at: now,
                    };
                    None
                }
            }
        }
    }

    /// Leave emergency mode unconditionally. Returns true if it was active.
    pub fn force_clear(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = EmergencyState::Normal;
        was_active
    }
}
