//! Execution gateway
//!
//! The gateway is the single entry point for every query a host application
//! sends to its backing store. A call passes through, in order:
//!
//! ```text
//! execute(op, options)
//!   │
//!   ├─► result cache ──────────── hit ──► return
//!   ├─► quota admission ───── throttle/deny ──► QuotaExceeded
//!   ├─► dedup (keyed reads) ── in flight ──► join shared outcome
//!   ├─► batcher (eligible reads)
//!   └─► connection budget ─► breaker + retry/backoff ─► store
//!                                        │
//!         record transfer, fill cache ◄──┘
//! ```
//!
//! The gateway owns its background tasks (health probe, cache sweep, quota
//! housekeeping, quota event listener) and tears them down in
//! [`ExecutionGateway::shutdown`].

mod metrics;
pub(crate) mod retry;
mod tasks;

pub use metrics::{BreakerSummary, ConnectionMetrics};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use quotagate_core_resilience::{
    BudgetConfig, CircuitBreaker, ConnectionBudget, HealthConfig, HealthMonitor, HealthReport,
    HealthSample, HealthStatus, ResilienceError,
};

use crate::batcher::RequestBatcher;
use crate::breaker::Breaker;
use crate::cache::{CacheStats, ResultCache};
use crate::config::{ConfigPatch, GatewayConfig};
use crate::dedup::QueryDeduplicator;
use crate::error::{GatewayError, QueryError, Result};
use crate::quota::{ProtectiveAction, QuotaStatus, QuotaTracker, RandomSource};
use crate::store::StoreConnector;
use crate::telemetry::GatewayTelemetry;

use metrics::RollingMetrics;
use retry::RetryPolicy;

/// External collaborators injected into a gateway
pub struct Collaborators {
    pub store: Arc<dyn StoreConnector>,
    pub breaker: Arc<dyn Breaker>,
    pub random: Box<dyn RandomSource>,
}

impl Collaborators {
    /// Default breaker and an OS-seeded random source around `store`
    pub fn with_store(store: Arc<dyn StoreConnector>) -> Self {
        Self {
            store,
            breaker: Arc::new(CircuitBreaker::new_default()),
            random: Box::new(StdRng::from_os_rng()),
        }
    }
}

/// Per-call options of [`ExecutionGateway::execute`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cache and dedup key; `None` bypasses both
    pub cache_key: Option<String>,
    /// TTL override for the cached result
    pub ttl: Option<Duration>,
    /// Safe to run alongside other reads in a micro-batch
    pub batch_eligible: bool,
    /// Operation label for logs
    pub label: &'static str,
}

impl ExecuteOptions {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ..Default::default()
        }
    }

    /// Read cached and deduplicated under `key`
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            label: "select",
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn batchable(mut self) -> Self {
        self.batch_eligible = true;
        self
    }
}

/// Values saved while emergency protection overrides them
#[derive(Debug, Clone, Copy)]
struct EmergencyBaseline {
    cache_ttl: Duration,
    max_connections: usize,
    ttl_factor: Option<u32>,
    reduced_connections: Option<usize>,
    tripped_breaker: bool,
}

/// Summary of a health check for callers that only want the headline
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: String,
    pub advisories: Vec<String>,
    pub effective_latency: Duration,
}

impl From<&HealthReport> for HealthSummary {
    fn from(report: &HealthReport) -> Self {
        Self {
            status: report.status.to_string(),
            advisories: report.advisories.iter().map(|a| format!("{:?}", a)).collect(),
            effective_latency: report.effective_latency,
        }
    }
}

pub struct ExecutionGateway {
    config: RwLock<Arc<GatewayConfig>>,
    cache: ResultCache,
    dedup: QueryDeduplicator,
    quota: QuotaTracker,
    batcher: RequestBatcher,
    budget: ConnectionBudget,
    breaker: Arc<dyn Breaker>,
    store: Arc<dyn StoreConnector>,
    health: Mutex<HealthMonitor>,
    rolling: Mutex<RollingMetrics>,
    telemetry: GatewayTelemetry,
    emergency: tokio::sync::Mutex<Option<EmergencyBaseline>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

fn budget_config(config: &GatewayConfig) -> BudgetConfig {
    BudgetConfig {
        max_size: config.max_connections,
        min_idle: config.min_connections,
        idle_timeout: Some(config.idle_timeout()),
        acquire_timeout: config.acquire_timeout(),
    }
}

fn health_config(config: &GatewayConfig) -> HealthConfig {
    HealthConfig {
        check_interval: config.health_check_interval(),
        ..HealthConfig::default()
    }
}

impl ExecutionGateway {
    /// Build a gateway without starting its background tasks
    pub fn new(config: GatewayConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            store,
            breaker,
            random,
        } = collaborators;

        Ok(Self {
            cache: ResultCache::new(
                config.cache_max_size,
                config.cache_max_bytes,
                config.cache_ttl(),
            ),
            dedup: QueryDeduplicator::new(),
            quota: QuotaTracker::with_random(&config, random),
            batcher: RequestBatcher::new(
                config.enable_request_batching,
                config.max_batch_size,
                config.batch_window(),
            ),
            budget: ConnectionBudget::new(budget_config(&config)),
            breaker,
            store,
            health: Mutex::new(HealthMonitor::new(health_config(&config))),
            rolling: Mutex::new(RollingMetrics::new()),
            telemetry: GatewayTelemetry::new()?,
            emergency: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            config: RwLock::new(Arc::new(config)),
        })
    }

    /// Build a gateway and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(config: GatewayConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(GatewayError::Config(
                "gateway must be initialized inside a tokio runtime".to_string(),
            ));
        }

        let gateway = Arc::new(Self::new(config, collaborators)?);
        let handles = tasks::spawn_all(&gateway);
        gateway.tasks.lock().extend(handles);

        let config = gateway.config();
        info!(
            max_connections = config.max_connections,
            cache_max_size = config.cache_max_size,
            max_data_transfer_mb = config.max_data_transfer_mb,
            dedup = config.enable_query_deduplication,
            batching = config.enable_request_batching,
            "Execution gateway initialized"
        );
        Ok(gateway)
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.config.read())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Run `op` through the full pipeline.
    ///
    /// `op` may be called several times (once per attempt). Its value is
    /// cached under `options.cache_key` and counted against the transfer
    /// quota by its JSON size.
    pub async fn execute<T, F, Fut>(self: &Arc<Self>, op: F, options: ExecuteOptions) -> Result<T>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        let config = self.config();

        if let Some(ref key) = options.cache_key {
            if let Some(value) = self.cache.get::<T>(key) {
                self.telemetry.cache_lookups_total.with_label_values(&["hit"]).inc();
                self.telemetry.queries_total.with_label_values(&["cache_hit"]).inc();
                debug!(key = %key, "Cache hit");
                return Ok(value);
            }
            self.telemetry.cache_lookups_total.with_label_values(&["miss"]).inc();
        }

        let decision = self.quota.check_admit();
        if !decision.is_allowed() {
            let utilization_pct = self.quota.utilization_pct();
            let label = decision.to_string();
            self.telemetry
                .quota_rejections_total
                .with_label_values(&[label.as_str()])
                .inc();
            self.telemetry.queries_total.with_label_values(&["rejected"]).inc();
            debug!(%decision, utilization_pct, "Query rejected by transfer quota");
            return Err(GatewayError::QuotaExceeded {
                decision,
                utilization_pct,
                key: options.cache_key.clone(),
            });
        }

        let dedup_key = options
            .cache_key
            .clone()
            .filter(|_| config.enable_query_deduplication);

        let this = Arc::clone(self);
        let work = async move { this.fetch_and_store(op, options).await };

        match dedup_key {
            Some(key) => {
                let result = self.dedup.run_deduplicated(&key, || work).await;
                self.telemetry
                    .dedup_collapsed
                    .set(self.dedup.stats().collapsed as i64);
                result
            }
            None => work.await,
        }
    }

    /// Keyed, batch-eligible read
    pub async fn execute_select<T, F, Fut>(
        self: &Arc<Self>,
        op: F,
        cache_key: &str,
        ttl: Option<Duration>,
    ) -> Result<T>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send + 'static,
    {
        if cache_key.is_empty() {
            return Err(GatewayError::Validation("cache key must not be empty".into()));
        }
        let mut options = ExecuteOptions::keyed(cache_key).batchable();
        options.ttl = ttl;
        self.execute(op, options).await
    }

    /// Uncached write; on success every cache key containing one of
    /// `invalidate_patterns` is removed.
    pub async fn execute_write<T, F, Fut>(
        self: &Arc<Self>,
        op: F,
        invalidate_patterns: &[&str],
    ) -> Result<T>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send + 'static,
    {
        let value = self.execute(op, ExecuteOptions::new("write")).await?;
        for pattern in invalidate_patterns {
            self.cache.invalidate(pattern);
        }
        Ok(value)
    }

    /// Run several operations concurrently through the direct path.
    ///
    /// Every operation runs to completion; the first error (in input order)
    /// is returned afterwards. Patterns are invalidated only if all succeed.
    pub async fn execute_batch<T, F, Fut>(
        self: &Arc<Self>,
        ops: Vec<F>,
        invalidate_patterns: &[&str],
    ) -> Result<Vec<T>>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send + 'static,
    {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let results = join_all(
            ops.into_iter()
                .map(|op| self.execute(op, ExecuteOptions::new("batch"))),
        )
        .await;

        let values = results.into_iter().collect::<Result<Vec<T>>>()?;
        for pattern in invalidate_patterns {
            self.cache.invalidate(pattern);
        }
        Ok(values)
    }

    /// Remove cached results whose key contains `pattern`
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern)
    }

    /// Batch-or-direct execution followed by cache fill and transfer accounting
    async fn fetch_and_store<T, F, Fut>(self: Arc<Self>, op: F, options: ExecuteOptions) -> Result<T>
    where
        T: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send + 'static,
    {
        let this = Arc::clone(&self);
        let key = options.cache_key.clone();
        let label = options.label;
        let direct = async move { this.run_direct(op, key.as_deref(), label).await };

        let value = self
            .batcher
            .maybe_batch(direct, options.batch_eligible, options.cache_key.as_deref())
            .await?;

        let mb = self.quota.record_transfer_of(&value);
        if let Some(ref key) = options.cache_key {
            self.cache.set(key, value.clone(), options.ttl);
        }
        debug!(label, transfer_mb = mb, "Execution recorded");
        Ok(value)
    }

    /// Connection lease, then breaker-protected retries
    async fn run_direct<T, F, Fut>(&self, op: F, key: Option<&str>, label: &'static str) -> Result<T>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, QueryError>> + Send,
    {
        let lease = self.budget.acquire().await.map_err(|e| match e {
            ResilienceError::BudgetExhausted(waited) => GatewayError::PoolTimeout { waited },
            ResilienceError::BudgetClosed => GatewayError::ShuttingDown,
            other => GatewayError::ExecutionFailed {
                key: key.map(str::to_string),
                attempts: 0,
                source: QueryError::Transient(other.to_string()),
            },
        })?;
        self.telemetry
            .connections_active
            .set(self.budget.stats().active as i64);

        let policy = RetryPolicy::from_config(&self.config());
        let started = Instant::now();
        let span = tracing::debug_span!("execute", label, key = key.unwrap_or(""));
        let result = retry::with_retry(
            &policy,
            self.breaker.as_ref(),
            self.store.as_ref(),
            label,
            key,
            &op,
        )
        .instrument(span)
        .await;
        let elapsed = started.elapsed();
        let held = lease.held_for();
        drop(lease);
        debug!(label, held_ms = held.as_millis() as u64, "Connection lease released");

        self.telemetry
            .connections_active
            .set(self.budget.stats().active as i64);
        self.telemetry
            .execution_latency_seconds
            .observe(elapsed.as_secs_f64());
        self.rolling.lock().record(elapsed, result.is_ok());

        match result {
            Ok(attempted) => {
                self.telemetry.queries_total.with_label_values(&["success"]).inc();
                if attempted.attempts > 1 {
                    self.telemetry
                        .retries_total
                        .inc_by(f64::from(attempted.attempts - 1));
                }
                Ok(attempted.value)
            }
            Err(e) => {
                self.telemetry.queries_total.with_label_values(&["failure"]).inc();
                warn!(label, error = %e, category = %e.category(), "Execution failed");
                Err(e)
            }
        }
    }

    /// Apply a partial configuration update to every component.
    ///
    /// Updates and emergency reconciliation serialize on the emergency lock,
    /// which is held from reading the current snapshot until the merged one
    /// is published.
    pub async fn update_config(&self, patch: ConfigPatch) -> Result<()> {
        let mut emergency = self.emergency.lock().await;

        let next = self.config().merged(&patch);
        next.validate()?;

        self.batcher.set_enabled(next.enable_request_batching);
        self.batcher
            .set_limits(next.max_batch_size, next.batch_window());
        self.cache
            .set_limits(next.cache_max_size, next.cache_max_bytes);
        self.budget.set_acquire_timeout(next.acquire_timeout());
        self.budget
            .set_advisory(next.min_connections, Some(next.idle_timeout()));
        self.quota
            .update_limits(next.max_data_transfer_mb, next.data_transfer_window());
        self.quota.set_policy(next.quota.clone());

        match emergency.as_mut() {
            Some(baseline) => {
                // Protective overrides stay in force; the new values
                // become the baseline restored when the emergency ends.
                baseline.cache_ttl = next.cache_ttl();
                baseline.max_connections = next.max_connections;
                let ttl = match baseline.ttl_factor {
                    Some(factor) => next.cache_ttl().saturating_mul(factor),
                    None => next.cache_ttl(),
                };
                self.cache.set_default_ttl(ttl);
                let max = match baseline.reduced_connections {
                    Some(reduced) => reduced.min(next.max_connections),
                    None => next.max_connections,
                };
                self.budget.resize(max);
            }
            None => {
                self.cache.set_default_ttl(next.cache_ttl());
                self.budget.resize(next.max_connections);
            }
        }

        *self.config.write() = Arc::new(next);
        drop(emergency);
        info!(?patch, "Gateway configuration updated");
        Ok(())
    }

    /// Run one quota housekeeping pass and apply any resulting protective actions
    pub async fn quota_housekeeping(&self) {
        let event = self.quota.housekeeping();
        let status = self.quota.status();
        self.telemetry
            .quota_utilization_pct
            .set(status.utilization_pct);
        if event.is_some() {
            self.reconcile_emergency().await;
        }
    }

    /// Bring protective overrides in line with the tracker's emergency state
    pub(crate) async fn reconcile_emergency(&self) {
        let active = self.quota.is_emergency();
        let mut guard = self.emergency.lock().await;

        match (active, guard.is_some()) {
            (true, false) => {
                let config = self.config();
                let mut baseline = EmergencyBaseline {
                    cache_ttl: self.cache.default_ttl(),
                    max_connections: config.max_connections,
                    ttl_factor: None,
                    reduced_connections: None,
                    tripped_breaker: false,
                };
                let actions = [
                    ProtectiveAction::ExtendCacheTtl {
                        factor: config.quota.emergency_ttl_factor,
                    },
                    ProtectiveAction::ReduceConnections {
                        max_connections: config.quota.emergency_max_connections,
                    },
                    ProtectiveAction::TripCircuitBreaker,
                ];
                for action in actions {
                    self.apply_action(action, &mut baseline).await;
                }
                *guard = Some(baseline);
                self.telemetry.emergency_active.set(1);
                warn!("Emergency protective actions applied");
            }
            (false, true) => {
                if let Some(baseline) = guard.take() {
                    self.cache.set_default_ttl(baseline.cache_ttl);
                    self.budget.resize(baseline.max_connections);
                    if baseline.tripped_breaker {
                        self.breaker.reset().await;
                    }
                }
                self.telemetry.emergency_active.set(0);
                info!("Emergency protective actions lifted");
            }
            _ => {}
        }
    }

    async fn apply_action(&self, action: ProtectiveAction, baseline: &mut EmergencyBaseline) {
        info!(%action, "Applying protective action");
        match action {
            ProtectiveAction::ExtendCacheTtl { factor } => {
                self.cache
                    .set_default_ttl(baseline.cache_ttl.saturating_mul(factor));
                baseline.ttl_factor = Some(factor);
            }
            ProtectiveAction::ReduceConnections { max_connections } => {
                let reduced = max_connections.min(baseline.max_connections);
                self.budget.resize(reduced);
                baseline.reduced_connections = Some(reduced);
            }
            ProtectiveAction::TripCircuitBreaker => {
                self.breaker.trip().await;
                baseline.tripped_breaker = true;
            }
        }
    }

    /// Probe the store and classify health
    pub async fn run_health_check(&self) -> HealthReport {
        let timeout = self.config().query_timeout();
        let started = Instant::now();
        let probe_latency = match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(Ok(())) => Some(started.elapsed()),
            Ok(Err(e)) => {
                warn!(error = %e, "Health probe failed");
                None
            }
            Err(_) => {
                warn!(?timeout, "Health probe timed out");
                None
            }
        };

        let breaker_open = self.breaker.state().await.is_open();
        let (failure_rate, avg_latency) = {
            let rolling = self.rolling.lock();
            (rolling.failure_rate(), rolling.avg_latency())
        };

        let report = self.health.lock().check(HealthSample {
            failure_rate,
            avg_latency,
            probe_latency,
            breaker_open,
        });

        match report.status {
            HealthStatus::Healthy => debug!("Store healthy"),
            HealthStatus::Degraded => {
                warn!(advisories = ?report.advisories, "Store degraded")
            }
            HealthStatus::Critical => {
                warn!(advisories = ?report.advisories, "Store critical")
            }
        }
        report
    }

    /// The most recent health report, if a check has run
    pub fn health(&self) -> Option<HealthReport> {
        self.health.lock().last_report().cloned()
    }

    pub async fn connection_metrics(&self) -> ConnectionMetrics {
        let breaker = self.breaker.metrics().await;
        let health = self
            .health
            .lock()
            .last_report()
            .map(|r| r.status)
            .unwrap_or_default();
        let rolling = self.rolling.lock();
        ConnectionMetrics::assemble(
            self.budget.stats(),
            &rolling,
            health,
            &breaker,
            self.dedup.stats(),
            self.dedup.in_flight(),
            self.batcher.stats(),
        )
    }

    pub fn cache_metrics(&self) -> CacheStats {
        self.cache.metrics()
    }

    pub fn quota_status(&self) -> QuotaStatus {
        self.quota.status()
    }

    /// The transfer tracker, for recording transfers made outside the gateway
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Reset the transfer window, leave emergency mode and lift protective actions
    pub async fn force_quota_reset(&self) {
        self.quota.force_reset();
        self.reconcile_emergency().await;
    }

    /// Prometheus text exposition of this gateway's metrics
    pub fn render_metrics(&self) -> Result<String> {
        self.telemetry
            .quota_utilization_pct
            .set(self.quota.utilization_pct());
        self.telemetry
            .dedup_collapsed
            .set(self.dedup.stats().collapsed as i64);
        self.telemetry.render()
    }

    /// Stop background tasks, reject queued and future requests
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let rejected = self.batcher.shutdown();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.budget.close();

        info!(rejected, "Execution gateway shut down");
    }
}

impl Drop for ExecutionGateway {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ExecutionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGateway")
            .field("cache", &self.cache)
            .field("quota", &self.quota)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use quotagate_core_resilience::CircuitBreakerConfig;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct Fixed(f64);

    impl RandomSource for Fixed {
        fn next_f64(&mut self) -> f64 {
            self.0
        }
    }

    fn gateway(config: GatewayConfig, store: &MemoryStore) -> Arc<ExecutionGateway> {
        let collaborators = Collaborators {
            store: Arc::new(store.clone()),
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            random: Box::new(Fixed(0.99)),
        };
        Arc::new(ExecutionGateway::new(config, collaborators).unwrap())
    }

    type ReadFuture = futures::future::BoxFuture<'static, std::result::Result<Value, QueryError>>;

    fn read(store: &MemoryStore, key: &'static str) -> impl Fn() -> ReadFuture + Send + Sync + 'static {
        let store = store.clone();
        move || -> ReadFuture {
            let store = store.clone();
            Box::pin(async move { store.query(key).await })
        }
    }

    #[tokio::test]
    async fn test_select_is_cached() {
        let store = MemoryStore::new();
        store.insert("orders:1", json!({"qty": 2}));
        let gw = gateway(GatewayConfig::default(), &store);

        let first: Value = gw
            .execute_select(read(&store, "orders:1"), "orders:1", None)
            .await
            .unwrap();
        let second: Value = gw
            .execute_select(read(&store, "orders:1"), "orders:1", None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.stats().queries, 1);
        assert_eq!(gw.cache_metrics().hits, 1);
        assert!(gw.quota_status().used_mb > 0.0);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = MemoryStore::new();
        let gw = gateway(GatewayConfig::default(), &store);
        let err = gw
            .execute_select(read(&store, "x"), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_write_invalidates_patterns() {
        let store = MemoryStore::new();
        store.insert("positions:1", json!(1));
        let gw = gateway(GatewayConfig::default(), &store);

        let _: Value = gw
            .execute_select(read(&store, "positions:1"), "positions:1", None)
            .await
            .unwrap();
        assert_eq!(gw.cache_metrics().entries, 1);

        let writer = store.clone();
        gw.execute_write(
            move || {
                let writer = writer.clone();
                async move { writer.write("positions:1", json!(5)).await }
            },
            &["positions"],
        )
        .await
        .unwrap();

        assert_eq!(gw.cache_metrics().entries, 0);
        let fresh: Value = gw
            .execute_select(read(&store, "positions:1"), "positions:1", None)
            .await
            .unwrap();
        assert_eq!(fresh, json!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let store = MemoryStore::new();
        store.insert("k", json!("v"));
        let config = GatewayConfig {
            max_retries: 1,
            ..Default::default()
        };
        let gw = gateway(config, &store);

        store.fail_next(QueryError::Permanent("syntax".into()));
        let err = gw
            .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ExecutionFailed { attempts: 1, .. }));
        assert_eq!(gw.cache_metrics().entries, 0);

        let ok: Value = gw.execute_select(read(&store, "k"), "k", None).await.unwrap();
        assert_eq!(ok, json!("v"));
    }

    #[tokio::test]
    async fn test_execute_batch_returns_first_error_after_all_settle() {
        let store = MemoryStore::new();
        let gw = gateway(
            GatewayConfig {
                max_retries: 1,
                ..Default::default()
            },
            &store,
        );
        let completed = Arc::new(AtomicUsize::new(0));

        let ops: Vec<_> = (0..3)
            .map(|i| {
                let completed = Arc::clone(&completed);
                move || {
                    let completed = Arc::clone(&completed);
                    async move {
                        completed.fetch_add(1, Ordering::SeqCst);
                        if i == 1 {
                            Err(QueryError::Permanent("constraint".into()))
                        } else {
                            Ok(i)
                        }
                    }
                }
            })
            .collect();

        let err = gw.execute_batch(ops, &[]).await.unwrap_err();
        assert!(matches!(err, GatewayError::ExecutionFailed { .. }));
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let store = MemoryStore::new();
        let gw = gateway(GatewayConfig::default(), &store);
        gw.shutdown().await;
        gw.shutdown().await;

        let err = gw
            .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_update_config_applies_to_components() {
        let store = MemoryStore::new();
        let gw = gateway(GatewayConfig::default(), &store);

        gw.update_config(ConfigPatch {
            max_connections: Some(3),
            cache_ttl_ms: Some(1_000),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(gw.config().max_connections, 3);
        assert_eq!(gw.connection_metrics().await.max_connections, 3);
        assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(1));

        let err = gw
            .update_config(ConfigPatch {
                max_connections: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(gw.config().max_connections, 3);
    }

    #[tokio::test]
    async fn test_overlapping_updates_both_land() {
        let store = MemoryStore::new();
        let gw = gateway(GatewayConfig::default(), &store);

        // Queue both updates behind a held lock so they contend on release
        let held = gw.emergency.lock().await;
        let first = tokio::spawn({
            let gw = gw.clone();
            async move {
                gw.update_config(ConfigPatch {
                    max_batch_size: Some(3),
                    ..Default::default()
                })
                .await
            }
        });
        let second = tokio::spawn({
            let gw = gw.clone();
            async move {
                gw.update_config(ConfigPatch {
                    cache_ttl_ms: Some(1_000),
                    ..Default::default()
                })
                .await
            }
        });
        tokio::task::yield_now().await;
        drop(held);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let config = gw.config();
        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.cache_ttl_ms, 1_000);
        assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_applies_and_lifts_protective_actions() {
        let store = MemoryStore::new();
        let config = GatewayConfig {
            max_connections: 8,
            cache_ttl_ms: 60_000,
            max_data_transfer_mb: 10.0,
            ..Default::default()
        };
        let gw = gateway(config, &store);

        gw.quota.record_transfer(9.9);
        gw.quota_housekeeping().await;

        assert!(gw.quota_status().emergency);
        assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(240));
        assert_eq!(gw.connection_metrics().await.max_connections, 2);
        assert!(gw.breaker.state().await.is_open());

        let err = gw
            .execute_select::<Value, _, _>(read(&store, "k"), "k", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded { .. }));

        gw.force_quota_reset().await;
        assert!(!gw.quota_status().emergency);
        assert_eq!(gw.cache_metrics().default_ttl, Duration::from_secs(60));
        assert_eq!(gw.connection_metrics().await.max_connections, 8);
        assert!(gw.breaker.is_healthy().await);
    }

    #[tokio::test]
    async fn test_health_check_reports_probe_failure() {
        let store = MemoryStore::new();
        let gw = gateway(GatewayConfig::default(), &store);

        assert!(gw.health().is_none());
        assert_eq!(gw.run_health_check().await.status, HealthStatus::Healthy);

        store.set_ping_failure(Some(QueryError::Transient("refused".into())));
        let report = gw.run_health_check().await;
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(gw.health().unwrap().status, HealthStatus::Critical);
        assert_eq!(
            HealthSummary::from(&report).status,
            "critical".to_string()
        );
    }

    #[tokio::test]
    async fn test_render_metrics() {
        let store = MemoryStore::new();
        store.insert("a", json!(1));
        let gw = gateway(GatewayConfig::default(), &store);
        let _: Value = gw.execute_select(read(&store, "a"), "a", None).await.unwrap();

        let text = gw.render_metrics().unwrap();
        assert!(text.contains("quotagate_queries_total{outcome=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_init_requires_runtime_and_starts_tasks() {
        let store = MemoryStore::new();
        let gw = ExecutionGateway::init(
            GatewayConfig::default(),
            Collaborators::with_store(Arc::new(store)),
        )
        .unwrap();
        assert_eq!(gw.tasks.lock().len(), 4);
        gw.shutdown().await;
        assert!(gw.tasks.lock().is_empty());
    }
}
