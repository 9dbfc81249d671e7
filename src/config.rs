/*!
 * Configuration types for quotagate
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Main gateway configuration.
///
/// Every field can be changed at runtime through
/// [`ExecutionGateway::update_config`](crate::gateway::ExecutionGateway::update_config);
/// periodic tasks read the latest snapshot on each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum concurrent physical executions against the store
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Advertised minimum of warm connections (reported only)
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// How long a query waits for a connection slot
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Advertised idle timeout of the store driver (reported only)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Time allowance of a single execution attempt (and the health probe)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Maximum attempts per physical execution
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay of the exponential backoff between attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Cap on the backoff delay between attempts
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Interval of the liveness probe
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Maximum number of cached results
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,

    /// Maximum estimated bytes held by the result cache
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Default time-to-live of cached results
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Interval of the expired-entry sweep
    #[serde(default = "default_cache_sweep_interval_ms")]
    pub cache_sweep_interval_ms: u64,

    /// Collapse concurrent identical reads into one execution
    #[serde(default = "default_true")]
    pub enable_query_deduplication: bool,

    /// Estimated transfer allowed per quota window, in MB
    #[serde(default = "default_max_data_transfer_mb")]
    pub max_data_transfer_mb: f64,

    /// Length of the quota window
    #[serde(default = "default_data_transfer_window_ms")]
    pub data_transfer_window_ms: u64,

    /// Interval of quota housekeeping (window roll, alerts, emergency re-check)
    #[serde(default = "default_quota_check_interval_ms")]
    pub quota_check_interval_ms: u64,

    /// Group batch-eligible reads into micro-batches
    #[serde(default = "default_true")]
    pub enable_request_batching: bool,

    /// Flush a batch as soon as it holds this many requests
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long the first request of a batch waits for company
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Throttling tiers and emergency controller tunables
    #[serde(default)]
    pub quota: QuotaPolicy,

    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunables of the quota tiers and the emergency controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Utilization above which the high throttle tier applies
    #[serde(default = "default_throttle_high_pct")]
    pub throttle_high_pct: f64,

    /// Rejection probability of the high tier
    #[serde(default = "default_throttle_high_probability")]
    pub throttle_high_probability: f64,

    /// Utilization above which the low throttle tier applies
    #[serde(default = "default_throttle_low_pct")]
    pub throttle_low_pct: f64,

    /// Rejection probability of the low tier
    #[serde(default = "default_throttle_low_probability")]
    pub throttle_low_probability: f64,

    /// Utilization above which emergency mode is entered
    #[serde(default = "default_emergency_entry_pct")]
    pub emergency_entry_pct: f64,

    /// Utilization below which emergency mode may be left
    #[serde(default = "default_emergency_recovery_pct")]
    pub emergency_recovery_pct: f64,

    /// Minimum time spent in emergency before each recovery check
    #[serde(default = "default_emergency_dwell_ms")]
    pub emergency_dwell_ms: u64,

    /// Factor applied to the cache TTL while in emergency
    #[serde(default = "default_emergency_ttl_factor")]
    pub emergency_ttl_factor: u32,

    /// Connection budget while in emergency
    #[serde(default = "default_emergency_max_connections")]
    pub emergency_max_connections: usize,

    /// Maximum alerts kept in the alert log
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,

    /// Maximum age of alerts kept in the alert log
    #[serde(default = "default_alert_max_age_ms")]
    pub alert_max_age_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Emit JSON lines to stdout instead of the compact format
    #[serde(default)]
    pub json: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Partial configuration applied by `update_config`.
///
/// `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub max_connections: Option<usize>,
    pub min_connections: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub cache_max_size: Option<usize>,
    pub cache_max_bytes: Option<usize>,
    pub cache_ttl_ms: Option<u64>,
    pub cache_sweep_interval_ms: Option<u64>,
    pub enable_query_deduplication: Option<bool>,
    pub max_data_transfer_mb: Option<f64>,
    pub data_transfer_window_ms: Option<u64>,
    pub quota_check_interval_ms: Option<u64>,
    pub enable_request_batching: Option<bool>,
    pub max_batch_size: Option<usize>,
    pub batch_window_ms: Option<u64>,
    pub quota: Option<QuotaPolicy>,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_cache_max_size() -> usize {
    1_000
}

fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_cache_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_data_transfer_mb() -> f64 {
    100.0
}

fn default_data_transfer_window_ms() -> u64 {
    300_000
}

fn default_quota_check_interval_ms() -> u64 {
    10_000
}

fn default_max_batch_size() -> usize {
    10
}

fn default_batch_window_ms() -> u64 {
    10
}

fn default_throttle_high_pct() -> f64 {
    90.0
}

fn default_throttle_high_probability() -> f64 {
    0.5
}

fn default_throttle_low_pct() -> f64 {
    80.0
}

fn default_throttle_low_probability() -> f64 {
    0.25
}

fn default_emergency_entry_pct() -> f64 {
    95.0
}

fn default_emergency_recovery_pct() -> f64 {
    70.0
}

fn default_emergency_dwell_ms() -> u64 {
    300_000
}

fn default_emergency_ttl_factor() -> u32 {
    4
}

fn default_emergency_max_connections() -> usize {
    2
}

fn default_alert_capacity() -> usize {
    100
}

fn default_alert_max_age_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            cache_max_size: default_cache_max_size(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_sweep_interval_ms: default_cache_sweep_interval_ms(),
            enable_query_deduplication: true,
            max_data_transfer_mb: default_max_data_transfer_mb(),
            data_transfer_window_ms: default_data_transfer_window_ms(),
            quota_check_interval_ms: default_quota_check_interval_ms(),
            enable_request_batching: true,
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            quota: QuotaPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            throttle_high_pct: default_throttle_high_pct(),
            throttle_high_probability: default_throttle_high_probability(),
            throttle_low_pct: default_throttle_low_pct(),
            throttle_low_probability: default_throttle_low_probability(),
            emergency_entry_pct: default_emergency_entry_pct(),
            emergency_recovery_pct: default_emergency_recovery_pct(),
            emergency_dwell_ms: default_emergency_dwell_ms(),
            emergency_ttl_factor: default_emergency_ttl_factor(),
            emergency_max_connections: default_emergency_max_connections(),
            alert_capacity: default_alert_capacity(),
            alert_max_age_ms: default_alert_max_age_ms(),
        }
    }
}

impl QuotaPolicy {
    pub fn emergency_dwell(&self) -> Duration {
        Duration::from_millis(self.emergency_dwell_ms)
    }

    pub fn alert_max_age(&self) -> Duration {
        Duration::from_millis(self.alert_max_age_ms)
    }

    fn validate(&self) -> Result<()> {
        let pct_fields = [
            ("throttle_high_pct", self.throttle_high_pct),
            ("throttle_low_pct", self.throttle_low_pct),
            ("emergency_entry_pct", self.emergency_entry_pct),
            ("emergency_recovery_pct", self.emergency_recovery_pct),
        ];
        for (name, value) in pct_fields {
            if !(0.0..=100.0).contains(&value) {
                return Err(GatewayError::Validation(format!(
                    "quota.{} must be within 0..=100, got {}",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("throttle_high_probability", self.throttle_high_probability),
            ("throttle_low_probability", self.throttle_low_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GatewayError::Validation(format!(
                    "quota.{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }

        if self.throttle_low_pct > self.throttle_high_pct {
            return Err(GatewayError::Validation(
                "quota.throttle_low_pct must not exceed quota.throttle_high_pct".to_string(),
            ));
        }
        if self.emergency_ttl_factor == 0 {
            return Err(GatewayError::Validation(
                "quota.emergency_ttl_factor must be at least 1".to_string(),
            ));
        }
        if self.emergency_max_connections == 0 {
            return Err(GatewayError::Validation(
                "quota.emergency_max_connections must be at least 1".to_string(),
            ));
        }
        if self.alert_capacity == 0 {
            return Err(GatewayError::Validation(
                "quota.alert_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = toml::from_str(&contents).map_err(|e| {
            GatewayError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(format!("failed to encode config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            GatewayError::Config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Small budget, long cache TTL and an early emergency gate
    pub fn conservative_preset() -> Self {
        Self {
            max_connections: 4,
            max_retries: 2,
            cache_ttl_ms: 15 * 60 * 1000,
            max_data_transfer_mb: 50.0,
            max_batch_size: 20,
            batch_window_ms: 25,
            quota: QuotaPolicy {
                emergency_entry_pct: 90.0,
                ..QuotaPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Wide budget, short batch window, deduplication and batching on
    pub fn high_throughput_preset() -> Self {
        Self {
            max_connections: 50,
            min_connections: 10,
            acquire_timeout_ms: 5_000,
            cache_max_size: 10_000,
            cache_max_bytes: 256 * 1024 * 1024,
            max_data_transfer_mb: 1_000.0,
            max_batch_size: 50,
            batch_window_ms: 5,
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(GatewayError::Validation(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_retries == 0 {
            return Err(GatewayError::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(GatewayError::Validation(
                "retry_base_delay_ms must not exceed retry_max_delay_ms".to_string(),
            ));
        }
        if self.cache_max_size == 0 {
            return Err(GatewayError::Validation(
                "cache_max_size must be at least 1".to_string(),
            ));
        }
        if !(self.max_data_transfer_mb.is_finite() && self.max_data_transfer_mb > 0.0) {
            return Err(GatewayError::Validation(
                "max_data_transfer_mb must be a positive number".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(GatewayError::Validation(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("cache_ttl_ms", self.cache_ttl_ms),
            ("cache_sweep_interval_ms", self.cache_sweep_interval_ms),
            ("data_transfer_window_ms", self.data_transfer_window_ms),
            ("quota_check_interval_ms", self.quota_check_interval_ms),
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(GatewayError::Validation(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        self.quota.validate()
    }

    /// Return a copy with the patch applied
    pub fn merged(&self, patch: &ConfigPatch) -> Self {
        let mut next = self.clone();
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field.clone() { next.$field = value; })*
            };
        }
        apply!(
            max_connections,
            min_connections,
            acquire_timeout_ms,
            idle_timeout_ms,
            query_timeout_ms,
            max_retries,
            retry_base_delay_ms,
            retry_max_delay_ms,
            health_check_interval_ms,
            cache_max_size,
            cache_max_bytes,
            cache_ttl_ms,
            cache_sweep_interval_ms,
            enable_query_deduplication,
            max_data_transfer_mb,
            data_transfer_window_ms,
            quota_check_interval_ms,
            enable_request_batching,
            max_batch_size,
            batch_window_ms,
            quota,
        );
        next
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn data_transfer_window(&self) -> Duration {
        Duration::from_millis(self.data_transfer_window_ms)
    }

    pub fn quota_check_interval(&self) -> Duration {
        Duration::from_millis(self.quota_check_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}
