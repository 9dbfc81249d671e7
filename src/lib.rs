/*!
 * quotagate - quota-aware data-access gateway
 *
 * Sits between an application and its backing store and keeps the volume of
 * data pulled from the store inside a per-window budget:
 * - Result cache with TTL, entry and byte bounds, LRU eviction
 * - Deduplication of identical in-flight reads
 * - Transfer quota with probabilistic throttling and an emergency mode
 * - Micro-batching of eligible reads
 * - Connection budget, circuit breaker, retry with backoff and health probing
 */

pub mod batcher;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod quota;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheStats, ResultCache};
pub use config::{ConfigPatch, GatewayConfig, QuotaPolicy};
pub use error::{GatewayError, QueryError, Result};
pub use gateway::{
    Collaborators, ConnectionMetrics, ExecuteOptions, ExecutionGateway, HealthSummary,
};
pub use quota::{AdmitDecision, QuotaEvent, QuotaStatus, QuotaTracker, RandomSource};
pub use store::{MemoryStore, StoreConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
