//! Prometheus metrics for a gateway instance
//!
//! Each gateway owns its own [`Registry`] so several gateways (or tests)
//! can live in one process without colliding on metric names.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::{GatewayError, Result};

/// Metric handles registered on a per-gateway registry
#[derive(Clone)]
pub struct GatewayTelemetry {
    registry: Registry,

    /// Executions by outcome (success, failure, cache_hit, rejected)
    pub queries_total: CounterVec,

    /// Cache lookups by result (hit, miss)
    pub cache_lookups_total: CounterVec,

    /// Admission rejections by decision (throttle, deny)
    pub quota_rejections_total: CounterVec,

    /// Retry attempts beyond the first
    pub retries_total: Counter,

    /// Requests that joined an in-flight execution (mirrors dedup stats)
    pub dedup_collapsed: IntGauge,

    /// Physical execution latency
    /// Buckets: 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 2s, 5s, 10s
    pub execution_latency_seconds: Histogram,

    /// Transfer quota utilization in percent
    pub quota_utilization_pct: Gauge,

    /// Connection leases currently held
    pub connections_active: IntGauge,

    /// 1 while emergency protection is active
    pub emergency_active: IntGauge,
}

fn prom_err(e: prometheus::Error) -> GatewayError {
    GatewayError::Config(format!("failed to register metric: {}", e))
}

impl GatewayTelemetry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            Opts::new("quotagate_queries_total", "Gateway executions by outcome"),
            &["outcome"],
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(queries_total.clone()))
            .map_err(prom_err)?;

        let cache_lookups_total = CounterVec::new(
            Opts::new("quotagate_cache_lookups_total", "Result cache lookups"),
            &["result"],
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(cache_lookups_total.clone()))
            .map_err(prom_err)?;

        let quota_rejections_total = CounterVec::new(
            Opts::new(
                "quotagate_quota_rejections_total",
                "Queries rejected by the transfer quota",
            ),
            &["decision"],
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(quota_rejections_total.clone()))
            .map_err(prom_err)?;

        let retries_total = Counter::with_opts(Opts::new(
            "quotagate_retries_total",
            "Execution attempts beyond the first",
        ))
        .map_err(prom_err)?;
        registry
            .register(Box::new(retries_total.clone()))
            .map_err(prom_err)?;

        let dedup_collapsed = IntGauge::with_opts(Opts::new(
            "quotagate_dedup_collapsed",
            "Requests served by an execution already in flight",
        ))
        .map_err(prom_err)?;
        registry
            .register(Box::new(dedup_collapsed.clone()))
            .map_err(prom_err)?;

        let execution_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "quotagate_execution_latency_seconds",
                "Latency of physical executions against the store",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(execution_latency_seconds.clone()))
            .map_err(prom_err)?;

        let quota_utilization_pct = Gauge::with_opts(Opts::new(
            "quotagate_quota_utilization_percent",
            "Transfer quota utilization of the current window",
        ))
        .map_err(prom_err)?;
        registry
            .register(Box::new(quota_utilization_pct.clone()))
            .map_err(prom_err)?;

        let connections_active = IntGauge::with_opts(Opts::new(
            "quotagate_connections_active",
            "Connection leases currently held",
        ))
        .map_err(prom_err)?;
        registry
            .register(Box::new(connections_active.clone()))
            .map_err(prom_err)?;

        let emergency_active = IntGauge::with_opts(Opts::new(
            "quotagate_emergency_active",
            "Emergency quota protection state (1 = active)",
        ))
        .map_err(prom_err)?;
        registry
            .register(Box::new(emergency_active.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            queries_total,
            cache_lookups_total,
            quota_rejections_total,
            retries_total,
            dedup_collapsed,
            execution_latency_seconds,
            quota_utilization_pct,
            connections_active,
            emergency_active,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| GatewayError::Config(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| GatewayError::Config(format!("metrics are not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for GatewayTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayTelemetry").finish_non_exhaustive()
    }
}
