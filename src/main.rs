/*!
 * quotagate CLI
 *
 * Inspect gateway configuration files and drive a simulated workload against
 * an in-memory store to see caching, deduplication and quota behaviour.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quotagate::{
    config::{GatewayConfig, LogLevel},
    logging, Collaborators, ExecutionGateway, GatewayError, HealthSummary, MemoryStore,
};

#[derive(Parser)]
#[command(name = "quotagate")]
#[command(version, about = "Quota-aware data-access gateway", long_about = None)]
struct Cli {
    /// Gateway configuration file (TOML)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", value_enum, default_value = "info", global = true)]
    log_level: LogLevelArg,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to the TOML file
        file: PathBuf,
    },

    /// Show configuration presets
    Presets,

    /// Write a configuration preset to a file
    Init {
        /// Destination path
        file: PathBuf,

        /// Preset to write
        #[arg(long, value_enum, default_value = "default")]
        preset: PresetArg,
    },

    /// Run a simulated read workload against an in-memory store
    Simulate {
        /// Number of requests to issue
        #[arg(short = 'n', long, default_value = "200")]
        requests: usize,

        /// Number of distinct keys the requests spread over
        #[arg(short = 'k', long, default_value = "20")]
        keys: usize,

        /// Approximate size of each stored value in KiB
        #[arg(long, default_value = "64")]
        value_kib: usize,

        /// Simulated store latency in milliseconds
        #[arg(long, default_value = "5")]
        latency_ms: u64,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    Default,
    Conservative,
    HighThroughput,
}

impl PresetArg {
    fn config(self) -> GatewayConfig {
        match self {
            PresetArg::Default => GatewayConfig::default(),
            PresetArg::Conservative => GatewayConfig::conservative_preset(),
            PresetArg::HighThroughput => GatewayConfig::high_throughput_preset(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config.logging.level = cli.log_level.into();
    config.logging.json |= cli.json_logs;

    if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::CheckConfig { file } => check_config(&file),
        Commands::Presets => {
            println!("{}", preset_table());
            Ok(())
        }
        Commands::Init { file, preset } => {
            preset.config().to_file(&file)?;
            println!("Wrote {:?} preset to {}", preset, file.display());
            Ok(())
        }
        Commands::Simulate {
            requests,
            keys,
            value_kib,
            latency_ms,
            metrics,
        } => simulate(config, requests, keys, value_kib, latency_ms, metrics).await,
    }
}

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(cells: &[&str]) -> Vec<Cell> {
    cells
        .iter()
        .map(|c| Cell::new(c).fg(Color::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

fn stats_table(title: &str, items: &[(&str, String)]) -> Table {
    let mut table = create_table();
    table.set_header(header(&[title, ""]));
    for (key, value) in items {
        table.add_row(vec![Cell::new(key).fg(Color::Cyan), Cell::new(value)]);
    }
    table
}

fn check_config(file: &PathBuf) -> Result<()> {
    let config = GatewayConfig::from_file(file)
        .with_context(|| format!("{} is not a valid gateway configuration", file.display()))?;

    let table = stats_table(
        "Setting",
        &[
            ("max_connections", config.max_connections.to_string()),
            ("acquire_timeout", format!("{:?}", config.acquire_timeout())),
            ("max_retries", config.max_retries.to_string()),
            ("cache_max_size", config.cache_max_size.to_string()),
            ("cache_max_bytes", config.cache_max_bytes.to_string()),
            ("cache_ttl", format!("{:?}", config.cache_ttl())),
            ("max_data_transfer_mb", format!("{:.1}", config.max_data_transfer_mb)),
            ("data_transfer_window", format!("{:?}", config.data_transfer_window())),
            (
                "emergency entry / recovery",
                format!(
                    "{:.0}% / {:.0}%",
                    config.quota.emergency_entry_pct, config.quota.emergency_recovery_pct
                ),
            ),
            ("deduplication", config.enable_query_deduplication.to_string()),
            ("batching", config.enable_request_batching.to_string()),
        ],
    );
    println!("{}", table);
    println!("{} is valid", file.display());
    Ok(())
}

fn preset_table() -> Table {
    let mut table = create_table();
    table.set_header(header(&[
        "Preset",
        "Connections",
        "Cache TTL",
        "Transfer budget",
        "Batch",
    ]));
    for preset in [
        PresetArg::Default,
        PresetArg::Conservative,
        PresetArg::HighThroughput,
    ] {
        let config = preset.config();
        table.add_row(vec![
            Cell::new(format!("{:?}", preset)).fg(Color::Green),
            Cell::new(config.max_connections),
            Cell::new(format!("{:?}", config.cache_ttl())),
            Cell::new(format!(
                "{:.0} MB / {:?}",
                config.max_data_transfer_mb,
                config.data_transfer_window()
            )),
            Cell::new(format!(
                "{} / {:?}",
                config.max_batch_size,
                config.batch_window()
            )),
        ]);
    }
    table
}

async fn simulate(
    config: GatewayConfig,
    requests: usize,
    keys: usize,
    value_kib: usize,
    latency_ms: u64,
    metrics: bool,
) -> Result<()> {
    let keys = keys.max(1);
    let store = MemoryStore::new();
    store.set_latency(Duration::from_millis(latency_ms));
    let payload = "x".repeat(value_kib * 1024);
    for i in 0..keys {
        store.insert(format!("item:{}", i), json!({ "id": i, "payload": payload }));
    }

    let gateway = ExecutionGateway::init(
        config,
        Collaborators::with_store(Arc::new(store.clone())),
    )?;

    let mut handles = Vec::with_capacity(requests);
    for i in 0..requests {
        let gateway = Arc::clone(&gateway);
        let store = store.clone();
        let key = format!("item:{}", i % keys);
        handles.push(tokio::spawn(async move {
            let query_key = key.clone();
            gateway
                .execute_select::<serde_json::Value, _, _>(
                    move || {
                        let store = store.clone();
                        let key = query_key.clone();
                        async move { store.query(&key).await }
                    },
                    &key,
                    None,
                )
                .await
        }));
    }

    let (mut ok, mut rejected, mut failed) = (0usize, 0usize, 0usize);
    for handle in handles {
        match handle.await.context("request task panicked")? {
            Ok(_) => ok += 1,
            Err(GatewayError::QuotaExceeded { .. }) => rejected += 1,
            Err(_) => failed += 1,
        }
    }

    let cache = gateway.cache_metrics();
    let quota = gateway.quota_status();
    let connections = gateway.connection_metrics().await;

    println!(
        "{}",
        stats_table(
            "Requests",
            &[
                ("succeeded", ok.to_string()),
                ("rejected by quota", rejected.to_string()),
                ("failed", failed.to_string()),
                ("store queries", store.stats().queries.to_string()),
                ("deduplicated", connections.dedup.collapsed.to_string()),
                ("batched", connections.batching.requests_batched.to_string()),
            ],
        )
    );
    println!(
        "{}",
        stats_table(
            "Cache",
            &[
                ("entries", cache.entries.to_string()),
                ("bytes", cache.bytes.to_string()),
                ("hit rate", format!("{:.1}%", cache.hit_rate() * 100.0)),
                ("evictions", cache.evictions.to_string()),
            ],
        )
    );
    println!(
        "{}",
        stats_table(
            "Quota",
            &[
                (
                    "transferred",
                    format!("{:.2} / {:.0} MB", quota.used_mb, quota.max_mb),
                ),
                ("utilization", format!("{:.1}%", quota.utilization_pct)),
                ("tier", quota.tier.to_string()),
                ("emergency", quota.emergency.to_string()),
                ("throttled / denied", format!("{} / {}", quota.throttled, quota.denied)),
            ],
        )
    );

    let health = HealthSummary::from(&gateway.run_health_check().await);
    let advisories = if health.advisories.is_empty() {
        "none".to_string()
    } else {
        health.advisories.join(", ")
    };
    println!(
        "{}",
        stats_table(
            "Health",
            &[
                ("status", health.status),
                ("effective latency", format!("{:?}", health.effective_latency)),
                ("advisories", advisories),
            ],
        )
    );

    if metrics {
        println!("{}", gateway.render_metrics()?);
    }

    gateway.shutdown().await;
    Ok(())
}
