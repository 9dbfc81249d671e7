/*!
 * Error types for quotagate
 */

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::quota::AdmitDecision;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error returned by a wrapped store operation.
///
/// Callers map their driver errors into one of these so the gateway can
/// decide whether another attempt is worthwhile.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// Failure that may succeed on another attempt (dropped connection, deadlock victim)
    #[error("transient query failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying (syntax, constraint violation)
    #[error("permanent query failure: {0}")]
    Permanent(String),

    /// The attempt exceeded its time allowance
    #[error("query attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_) | QueryError::Timeout(_))
    }
}

/// Errors surfaced to gateway callers
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Admission denied by the transfer quota; back off before retrying
    #[error("transfer quota {decision}: utilization {utilization_pct:.1}%{}", key_suffix(.key))]
    QuotaExceeded {
        decision: AdmitDecision,
        utilization_pct: f64,
        key: Option<String>,
    },

    /// Circuit breaker kept rejecting the operation
    #[error("circuit breaker open{}", key_suffix(.key))]
    CircuitOpen { key: Option<String> },

    /// The wrapped operation failed after exhausting its attempts
    #[error("execution failed after {attempts} attempt(s){}: {source}", key_suffix(.key))]
    ExecutionFailed {
        key: Option<String>,
        attempts: u32,
        #[source]
        source: QueryError,
    },

    /// No connection slot became free within the acquire timeout
    #[error("no connection available after waiting {waited:?}")]
    PoolTimeout { waited: Duration },

    /// Malformed operation input or configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// The gateway has been shut down
    #[error("gateway is shutting down")]
    ShuttingDown,
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_ref()
        .map(|k| format!(" (key {})", k))
        .unwrap_or_default()
}

impl GatewayError {
    /// Check if the caller may retry later
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::QuotaExceeded { .. }
            | GatewayError::CircuitOpen { .. }
            | GatewayError::PoolTimeout { .. } => true,
            GatewayError::ExecutionFailed { source, .. } => source.is_transient(),
            GatewayError::Validation(_) | GatewayError::Config(_) | GatewayError::ShuttingDown => {
                false
            }
        }
    }

    /// Get error category for logging and metrics labels
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::QuotaExceeded { .. } => ErrorCategory::Quota,
            GatewayError::CircuitOpen { .. } => ErrorCategory::Circuit,
            GatewayError::ExecutionFailed { .. } => ErrorCategory::Execution,
            GatewayError::PoolTimeout { .. } => ErrorCategory::Resource,
            GatewayError::Validation(_) => ErrorCategory::Validation,
            GatewayError::Config(_) => ErrorCategory::Configuration,
            GatewayError::ShuttingDown => ErrorCategory::Lifecycle,
        }
    }
}

/// Internal-only failure of a size or transfer estimate.
///
/// Never surfaced to callers: estimates fail open to zero.
#[derive(Debug, Error)]
pub(crate) enum EstimationError {
    #[error("value could not be serialized for size estimation: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Quota,
    Circuit,
    Execution,
    Resource,
    Validation,
    Configuration,
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Quota => write!(f, "quota"),
            ErrorCategory::Circuit => write!(f, "circuit"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
        }
    }
}
