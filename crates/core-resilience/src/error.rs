//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Connection budget is exhausted and the acquire wait timed out
    #[error("Connection budget exhausted after waiting {0:?}")]
    BudgetExhausted(Duration),

    /// Connection budget was closed (shutdown)
    #[error("Connection budget is closed")]
    BudgetClosed,

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::BudgetExhausted(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_) | ResilienceError::BudgetClosed
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::BudgetExhausted(_)
                | ResilienceError::BudgetClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Transient("network error".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
        assert!(transient.should_trip_breaker());

        let permanent = ResilienceError::Permanent("syntax error".to_string());
        assert!(!permanent.is_transient());
        assert!(permanent.is_permanent());
        assert!(permanent.should_trip_breaker());

        let circuit_open = ResilienceError::CircuitOpen;
        assert!(!circuit_open.is_transient());
        assert!(!circuit_open.should_trip_breaker());

        let exhausted = ResilienceError::BudgetExhausted(Duration::from_millis(5));
        assert!(exhausted.is_transient());
        assert!(!exhausted.should_trip_breaker());
    }
}
