//! Circuit breaker collaborator.
//!
//! The gateway only needs the breaker's public contract, so it is injected
//! as a trait object. Operations are passed as boxed futures to keep the
//! trait object-safe; the gateway carries typed results around the call.

use async_trait::async_trait;
use futures::future::BoxFuture;

use quotagate_core_resilience::{BreakerMetrics, CircuitBreaker, CircuitState, ResilienceError};

#[async_trait]
pub trait Breaker: Send + Sync {
    /// Run one attempt under breaker protection.
    ///
    /// Returns `ResilienceError::CircuitOpen` without running `op` while the
    /// circuit is open.
    async fn call<'a>(
        &self,
        op: BoxFuture<'a, Result<(), ResilienceError>>,
    ) -> Result<(), ResilienceError>;

    async fn is_healthy(&self) -> bool;

    async fn state(&self) -> CircuitState;

    async fn reset(&self);

    /// Open the circuit proactively
    async fn trip(&self);

    async fn metrics(&self) -> BreakerMetrics;
}

#[async_trait]
impl Breaker for CircuitBreaker {
    async fn call<'a>(
        &self,
        op: BoxFuture<'a, Result<(), ResilienceError>>,
    ) -> Result<(), ResilienceError> {
        CircuitBreaker::call(self, || op).await
    }

    async fn is_healthy(&self) -> bool {
        CircuitBreaker::is_healthy(self).await
    }

    async fn state(&self) -> CircuitState {
        self.get_state().await
    }

    async fn reset(&self) {
        CircuitBreaker::reset(self).await
    }

    async fn trip(&self) {
        CircuitBreaker::trip(self).await
    }

    async fn metrics(&self) -> BreakerMetrics {
        CircuitBreaker::metrics(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate_core_resilience::CircuitBreakerConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker() -> Arc<dyn Breaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
            slow_call_threshold: Duration::from_secs(1),
        }))
    }

    #[tokio::test]
    async fn test_trait_object_opens_after_failures() {
        let breaker = breaker();
        for _ in 0..2 {
            let result = breaker
                .call(Box::pin(async { Err::<(), _>(ResilienceError::Transient("reset".into())) }))
                .await;
            assert!(result.is_err());
        }

        assert!(breaker.state().await.is_open());
        assert!(!breaker.is_healthy().await);

        let rejected = breaker
            .call(Box::pin(async { Ok::<(), ResilienceError>(()) }))
            .await;
        assert_eq!(rejected, Err(ResilienceError::CircuitOpen));
        assert_eq!(breaker.metrics().await.rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_trip_and_reset() {
        let breaker = breaker();
        breaker.trip().await;
        assert!(breaker.state().await.is_open());
        breaker.reset().await;
        assert!(breaker.is_healthy().await);
    }

    #[tokio::test]
    async fn test_borrowed_slots_survive_call() {
        let breaker = breaker();
        let mut slot = None;
        breaker
            .call(Box::pin(async {
                slot = Some(5);
                Ok::<(), ResilienceError>(())
            }))
            .await
            .unwrap();
        assert_eq!(slot, Some(5));
    }
}
