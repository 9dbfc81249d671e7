//! quotagate Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the quotagate gateway composes in
//! front of a backing store:
//!
//! - **Circuit Breaker**: Prevents cascading failures by failing fast when the store is unhealthy
//! - **Connection Budget**: Resizable bound on concurrent physical executions with acquire timeouts
//! - **Health Monitor**: Classifies store health (healthy / degraded / critical) from probe samples
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage engines or query languages
//! - Caching or quota policy
//! - Application-specific concerns
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Gateway                         │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Budget                 │  ← Bounded concurrency
//! │  (Leases, acquire timeout, resize)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!          Backing store
//!
//!  Periodically:
//!   Health Monitor → HealthReport (status + advisories)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use quotagate_core_resilience::{
//!     BudgetConfig, CircuitBreaker, CircuitBreakerConfig, ConnectionBudget, ResilienceError,
//! };
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//! let budget = ConnectionBudget::new(BudgetConfig::default());
//!
//! let lease = budget.acquire().await?;
//! let rows = breaker.call(|| async { Ok::<_, ResilienceError>(vec![1, 2, 3]) }).await?;
//! drop(lease);
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_budget;
pub mod error;
pub mod health_monitor;

// Re-export main types for convenience
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection_budget::{BudgetConfig, BudgetStats, ConnectionBudget, ConnectionLease};
pub use error::ResilienceError;
pub use health_monitor::{
    Advisory, HealthConfig, HealthMonitor, HealthReport, HealthSample, HealthStatus,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use quotagate_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_budget::{BudgetConfig, ConnectionBudget, ConnectionLease};
    pub use super::error::ResilienceError;
    pub use super::health_monitor::{
        Advisory, HealthConfig, HealthMonitor, HealthReport, HealthSample, HealthStatus,
    };
}
