/*!
 * Retry logic with exponential backoff
 *
 * Each attempt runs through the circuit breaker and is bounded by the
 * attempt timeout. Between attempts the store's connection cache is cleared
 * so the next attempt reconnects.
 */

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use quotagate_core_resilience::ResilienceError;

use crate::breaker::Breaker;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, QueryError, Result};
use crate::store::StoreConnector;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            attempt_timeout: config.query_timeout(),
        }
    }

    /// Delay before attempt `attempt + 1`: `min(base * 2^(attempt-1), cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(2_u32.pow(exponent))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Successful value and the number of attempts it took
pub(crate) struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

fn to_resilience(e: &QueryError) -> ResilienceError {
    match e {
        QueryError::Transient(msg) => ResilienceError::Transient(msg.clone()),
        QueryError::Permanent(msg) => ResilienceError::Permanent(msg.clone()),
        QueryError::Timeout(d) => ResilienceError::Timeout(*d),
    }
}

/// Run `operation` with breaker protection, per-attempt timeout and backoff.
///
/// Transient failures and breaker rejections are retried up to
/// `policy.max_attempts`; a permanent failure ends the loop at once.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &dyn Breaker,
    store: &dyn StoreConnector,
    label: &str,
    key: Option<&str>,
    mut operation: F,
) -> Result<Attempted<T>>
where
    T: Send,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = std::result::Result<T, QueryError>> + Send,
{
    let mut attempt = 0;
    let mut last_error: Option<QueryError> = None;
    let mut rejected_last = false;

    while attempt < policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            debug!(
                label,
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                ?delay,
                "Retrying after backoff"
            );
            store.clear_connection_cache().await;
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        let mut value: Option<T> = None;
        let mut op_error: Option<QueryError> = None;
        let timeout = policy.attempt_timeout;
        let pending = operation();

        let outcome = breaker
            .call(Box::pin(async {
                match tokio::time::timeout(timeout, pending).await {
                    Ok(Ok(v)) => {
                        value = Some(v);
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        let mapped = to_resilience(&e);
                        op_error = Some(e);
                        Err(mapped)
                    }
                    Err(_) => {
                        op_error = Some(QueryError::Timeout(timeout));
                        Err(ResilienceError::Timeout(timeout))
                    }
                }
            }))
            .await;

        match (outcome, value) {
            (Ok(()), Some(value)) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            (Ok(()), None) => {
                // Breaker reported success without running the attempt
                last_error = Some(QueryError::Permanent(
                    "breaker completed without a result".into(),
                ));
                rejected_last = false;
            }
            (Err(ResilienceError::CircuitOpen), _) => {
                debug!(label, attempt, "Circuit open, attempt rejected");
                rejected_last = true;
            }
            (Err(_), _) => {
                rejected_last = false;
                if let Some(e) = op_error {
                    if !e.is_transient() {
                        warn!(label, attempt, error = %e, "Permanent failure, not retrying");
                        return Err(GatewayError::ExecutionFailed {
                            key: key.map(str::to_string),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    debug!(label, attempt, error = %e, "Transient failure");
                    last_error = Some(e);
                }
            }
        }
    }

    match last_error {
        Some(source) if !rejected_last => {
            warn!(label, attempts = attempt, error = %source, "Retries exhausted");
            Err(GatewayError::ExecutionFailed {
                key: key.map(str::to_string),
                attempts: attempt,
                source,
            })
        }
        _ => {
            warn!(label, attempts = attempt, "Circuit breaker kept rejecting");
            Err(GatewayError::CircuitOpen {
                key: key.map(str::to_string),
            })
        }
    }
}
