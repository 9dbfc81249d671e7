//! Opportunistic micro-batching of read operations.
//!
//! Batch-eligible requests are queued for a short window (or until the
//! queue reaches the size cap) and then executed concurrently as one batch.
//! Every request resolves its own caller, so a failing request never fails
//! the rest of its batch.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{GatewayError, QueryError};

struct BatchRequest {
    job: BoxFuture<'static, ()>,
    enqueued_at: Instant,
    cache_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct BatchSettings {
    enabled: bool,
    max_batch_size: usize,
    window: Duration,
}

struct BatchState {
    queue: Vec<BatchRequest>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a stale timer does not flush a newer batch
    generation: u64,
    shutting_down: bool,
}

/// Batch statistics snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub requests_batched: u64,
    pub requests_direct: u64,
    pub largest_batch: usize,
    pub pending: usize,
}

struct BatcherInner {
    state: Mutex<BatchState>,
    settings: Mutex<BatchSettings>,
    batches_flushed: AtomicU64,
    requests_batched: AtomicU64,
    requests_direct: AtomicU64,
    largest_batch: AtomicUsize,
}

impl BatcherInner {
    /// Take the queued requests and start running them. Caller holds the lock.
    fn take_batch(&self, state: &mut BatchState) -> Vec<BatchRequest> {
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut state.queue)
    }

    async fn run_batch(&self, batch: Vec<BatchRequest>) {
        if batch.is_empty() {
            return;
        }

        let size = batch.len();
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.largest_batch.fetch_max(size, Ordering::Relaxed);

        let oldest_wait = batch
            .iter()
            .map(|r| r.enqueued_at.elapsed())
            .max()
            .unwrap_or_default();
        let keyed = batch.iter().filter(|r| r.cache_key.is_some()).count();
        debug!(size, keyed, ?oldest_wait, "Flushing request batch");

        join_all(batch.into_iter().map(|r| r.job)).await;
    }
}

#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    pub fn new(enabled: bool, max_batch_size: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                state: Mutex::new(BatchState {
                    queue: Vec::new(),
                    timer: None,
                    generation: 0,
                    shutting_down: false,
                }),
                settings: Mutex::new(BatchSettings {
                    enabled,
                    max_batch_size: max_batch_size.max(1),
                    window,
                }),
                batches_flushed: AtomicU64::new(0),
                requests_batched: AtomicU64::new(0),
                requests_direct: AtomicU64::new(0),
                largest_batch: AtomicUsize::new(0),
            }),
        }
    }

    /// Run `job` as part of a batch when it is eligible and batching is on,
    /// otherwise run it directly.
    pub async fn maybe_batch<T, Fut>(
        &self,
        job: Fut,
        eligible: bool,
        cache_key: Option<&str>,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let settings = *self.inner.settings.lock();
        if !eligible || !settings.enabled {
            self.inner.requests_direct.fetch_add(1, Ordering::Relaxed);
            return job.await;
        }

        let (tx, rx) = oneshot::channel();
        let wrapped: BoxFuture<'static, ()> = Box::pin(async move {
            // A panic drops `tx`; the caller sees a closed channel
            if let Ok(result) = AssertUnwindSafe(job).catch_unwind().await {
                let _ = tx.send(result);
            }
        });

        self.enqueue(
            BatchRequest {
                job: wrapped,
                enqueued_at: Instant::now(),
                cache_key: cache_key.map(str::to_string),
            },
            settings,
        )?;

        match rx.await {
            Ok(result) => result,
            Err(_) if self.inner.state.lock().shutting_down => Err(GatewayError::ShuttingDown),
            Err(_) => Err(GatewayError::ExecutionFailed {
                key: cache_key.map(str::to_string),
                attempts: 1,
                source: QueryError::Permanent("batched query panicked".into()),
            }),
        }
    }

    fn enqueue(&self, request: BatchRequest, settings: BatchSettings) -> Result<(), GatewayError> {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return Err(GatewayError::ShuttingDown);
        }

        state.queue.push(request);
        self.inner.requests_batched.fetch_add(1, Ordering::Relaxed);
        trace!(pending = state.queue.len(), "Request queued for batching");

        if state.queue.len() >= settings.max_batch_size {
            let batch = self.inner.take_batch(&mut state);
            drop(state);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_batch(batch).await });
        } else if state.timer.is_none() {
            let generation = state.generation;
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(settings.window).await;
                let batch = {
                    let mut state = inner.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.timer = None;
                    state.generation += 1;
                    std::mem::take(&mut state.queue)
                };
                inner.run_batch(batch).await;
            }));
        }

        Ok(())
    }

    /// Number of requests waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.settings.lock().enabled = enabled;
    }

    pub fn set_limits(&self, max_batch_size: usize, window: Duration) {
        let mut settings = self.inner.settings.lock();
        settings.max_batch_size = max_batch_size.max(1);
        settings.window = window;
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches_flushed: self.inner.batches_flushed.load(Ordering::Relaxed),
            requests_batched: self.inner.requests_batched.load(Ordering::Relaxed),
            requests_direct: self.inner.requests_direct.load(Ordering::Relaxed),
            largest_batch: self.inner.largest_batch.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Stop accepting requests and reject everything still queued.
    /// Returns the number of rejected requests.
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            self.inner.take_batch(&mut state)
        };
        let rejected = dropped.len();
        // Dropping the jobs closes each caller's channel
        drop(dropped);
        if rejected > 0 {
            debug!(rejected, "Rejected queued requests on shutdown");
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher(max: usize, window_ms: u64) -> RequestBatcher {
        RequestBatcher::new(true, max, Duration::from_millis(window_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flush_groups_requests() {
        let batcher = batcher(10, 10);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let b = batcher.clone();
                tokio::spawn(async move { b.maybe_batch(async move { Ok(i * 2) }, true, None).await })
            })
            .collect();

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), i as i32 * 2);
        }

        let stats = batcher.stats();
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.requests_batched, 3);
        assert_eq!(stats.largest_batch, 3);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_isolated_within_batch() {
        let batcher = batcher(10, 10);

        let ok_a = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok("a") }, true, None).await })
        };
        let failing = {
            let b = batcher.clone();
            tokio::spawn(async move {
                b.maybe_batch::<&str, _>(
                    async {
                        Err(GatewayError::ExecutionFailed {
                            key: None,
                            attempts: 1,
                            source: QueryError::Permanent("bad row".into()),
                        })
                    },
                    true,
                    None,
                )
                .await
            })
        };
        let ok_c = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok("c") }, true, None).await })
        };

        assert_eq!(ok_a.await.unwrap().unwrap(), "a");
        assert!(failing.await.unwrap().is_err());
        assert_eq!(ok_c.await.unwrap().unwrap(), "c");
        assert_eq!(batcher.stats().batches_flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_flushes_immediately() {
        let batcher = batcher(2, 60_000);

        let first = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok(1) }, true, None).await })
        };
        let second = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok(2) }, true, None).await })
        };

        // Both resolve without the 60s window elapsing
        let started = Instant::now();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(batcher.stats().largest_batch, 2);
    }

    #[tokio::test]
    async fn test_ineligible_runs_directly() {
        let batcher = batcher(10, 10);
        let value = batcher.maybe_batch(async { Ok(7) }, false, None).await.unwrap();
        assert_eq!(value, 7);

        batcher.set_enabled(false);
        let value = batcher.maybe_batch(async { Ok(8) }, true, None).await.unwrap();
        assert_eq!(value, 8);

        let stats = batcher.stats();
        assert_eq!(stats.requests_direct, 2);
        assert_eq!(stats.batches_flushed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_queued() {
        let batcher = batcher(10, 1_000);

        let queued = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok(1) }, true, Some("k")).await })
        };
        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(batcher.shutdown(), 1);
        assert!(matches!(
            queued.await.unwrap(),
            Err(GatewayError::ShuttingDown)
        ));
        assert!(matches!(
            batcher.maybe_batch(async { Ok(2) }, true, None).await,
            Err(GatewayError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_does_not_poison_batch() {
        let batcher = batcher(10, 5);

        let bad = {
            let b = batcher.clone();
            tokio::spawn(async move {
                b.maybe_batch::<u8, _>(async { panic!("bad decoder") }, true, Some("bad"))
                    .await
            })
        };
        let good = {
            let b = batcher.clone();
            tokio::spawn(async move { b.maybe_batch(async { Ok(3u8) }, true, None).await })
        };

        assert!(matches!(
            bad.await.unwrap(),
            Err(GatewayError::ExecutionFailed { .. })
        ));
        assert_eq!(good.await.unwrap().unwrap(), 3);
    }
}
