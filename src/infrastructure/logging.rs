//! Logging system configuration and initialization
//!
//! Console output plus an optional daily-rolling file, either human readable
//! or JSON. `RUST_LOG` wins over the configured level when set.
//!
//! ```bash
//! # Show SQL statements too
//! RUST_LOG="debug,sqlx::query=debug" adr-orchestrator run
//! ```

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use lazy_static::lazy_static;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, fmt::time::ChronoUtc, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "adr-orchestrator.log";

lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Dependency targets quieted unless tracing at `trace`
const NOISY_TARGETS: &[&str] = &[
    "sqlx::query=warn",
    "sqlx::sqlite=warn",
    "reqwest=info",
    "hyper=warn",
    "hyper_util=warn",
    "h2=warn",
    "tokio=info",
];

/// Filter from `RUST_LOG`, else the configured level with dependency
/// noise suppressed.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    if !config.level.to_lowercase().contains("trace") {
        for directive in NOISY_TARGETS {
            filter = filter.add_directive(directive.parse()?);
        }
    }
    filter = filter.add_directive(format!("adr_orchestrator={}", config.level).parse()?);

    for directive in &config.module_filters {
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("Invalid log directive: {directive}"))?,
        );
    }
    Ok(filter)
}

fn console_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_timer(ChronoUtc::rfc_3339())
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_timer(ChronoUtc::rfc_3339())
            .with_target(false)
            .boxed()
    }
}

fn file_layer(log_dir: &Path, json: bool) -> Result<BoxedLayer> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = non_blocking(appender);
    LOG_GUARDS
        .lock()
        .map_err(|_| anyhow!("log guard registry poisoned"))?
        .push(guard);

    let layer = if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(ChronoUtc::rfc_3339())
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_timer(ChronoUtc::rfc_3339())
            .with_target(true)
            .with_ansi(false)
            .boxed()
    };
    Ok(layer)
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_logging_with_config(config: &LoggingConfig, log_dir: &Path) -> Result<()> {
    let filter = build_env_filter(config)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.console_output {
        layers.push(console_layer(config.json_format));
    }
    if config.file_output {
        layers.push(file_layer(log_dir, config.json_format)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    tracing::info!(
        level = %config.level,
        file_output = config.file_output,
        log_dir = %log_dir.display(),
        "Logging initialized"
    );
    Ok(())
}

/// Test subscriber routed through the test harness writer. Safe to call
/// repeatedly.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_builds() {
        let config = LoggingConfig::default();
        assert!(build_env_filter(&config).is_ok());
    }

    #[test]
    fn bad_module_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            module_filters: vec!["adr_orchestrator=shouting".to_string()],
            ..LoggingConfig::default()
        };
        assert!(build_env_filter(&config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        init_for_tests();
        init_for_tests();
    }
}
