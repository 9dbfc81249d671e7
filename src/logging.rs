/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;
use crate::error::{GatewayError, Result};

/// Initialize structured logging based on configuration.
///
/// `verbose` forces DEBUG regardless of the configured level. `RUST_LOG`
/// overrides both. Output goes to the log file as JSON when one is set,
/// otherwise to stdout (JSON lines or compact text).
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = build_filter(config, verbose)?;

    let file_layer = match config.file {
        Some(ref path) => Some(file_layer(path)?),
        None => None,
    };
    let to_stdout = file_layer.is_none();

    let json_layer = (to_stdout && config.json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::NONE)
            .json()
    });
    let compact_layer = (to_stdout && !config.json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_span_events(FmtSpan::NONE)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|e| GatewayError::Config(format!("Logging already initialized: {}", e)))
}

fn effective_level(config: &LoggingConfig, verbose: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    let log_level = effective_level(config, verbose);

    EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "quotagate={lvl},quotagate_core_resilience={lvl}",
                lvl = log_level
            ))
        })
        .map_err(|e| GatewayError::Config(format!("Failed to create log filter: {}", e)))
}

/// JSON layer writing to `log_path`, with span close events and source locations
fn file_layer<S>(log_path: &Path) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file = File::create(log_path).map_err(|e| {
        GatewayError::Config(format!(
            "Failed to create log file {}: {}",
            log_path.display(),
            e
        ))
    })?;

    Ok(fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json())
}

/// Install a test-writer subscriber once per test binary
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = fmt::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("quotagate=debug")),
            )
            .with_test_writer()
            .with_target(false)
            .compact()
            .try_init();
    });
}
