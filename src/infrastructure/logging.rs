//! Logging system configuration and initialization
//!
//! This module provides the collector's logging setup with:
//! - A rotating log file per run under the data directory's `logs/`
//! - Console output for the operator
//! - Optional structured JSON in the file layer
//! - `RUST_LOG` override of the default filter

#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow};
use chrono::Utc;
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::infrastructure::config::defaults;

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Logging settings for one run
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    /// File name prefix; the appender adds the rotation date
    pub file_prefix: String,
    pub max_files: usize,
}

impl LoggingConfig {
    /// Per-run file logging under `log_dir`
    #[must_use]
    pub fn for_run(log_dir: &Path, run_id: u64, verbose: bool) -> Self {
        Self {
            level: if verbose { "debug".to_string() } else { defaults::LOG_LEVEL.to_string() },
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: log_dir.to_path_buf(),
            file_prefix: format!("collector_run_{run_id}"),
            max_files: defaults::LOG_MAX_FILES,
        }
    }
}

/// ISO-8601 UTC timestamps, second precision
struct UtcSecondsFormatter;

impl FormatTime for UtcSecondsFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%dT%H:%M:%S"))
    }
}

/// Builds the default filter, quieting HTML and HTTP internals unless TRACE
fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut filter = EnvFilter::new(level);
    if !level.to_lowercase().contains("trace") {
        for directive in [
            "reqwest=info",
            "hyper=warn",
            "hyper_util=warn",
            "h2=warn",
            "html5ever=warn",
            "selectors=warn",
            "tokio=info",
        ] {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| anyhow!("Invalid log directive {}: {}", directive, e))?,
            );
        }
    }
    Ok(filter)
}

/// Initialize logging with the given configuration
///
/// Safe to call once per process; a second call fails because the global
/// subscriber is already set.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let registry = Registry::default().with(build_filter(&config.level)?);

    let file_writer = if config.file_output {
        std::fs::create_dir_all(&config.log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", config.log_dir, e))?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .max_log_files(config.max_files)
            .build(&config.log_dir)
            .map_err(|e| anyhow!("Failed to create rolling log file: {}", e))?;
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(guard);
        Some(writer)
    } else {
        None
    };

    // No ANSI color codes for file output
    let file_layer = file_writer.map(|writer| {
        let layer = fmt::Layer::new()
            .with_writer(writer)
            .with_timer(UtcSecondsFormatter)
            .with_target(false)
            .with_ansi(false);
        if config.json_format {
            layer.json().with_current_span(true).boxed()
        } else {
            layer.boxed()
        }
    });
    let console_layer = config.console_output.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(UtcSecondsFormatter)
            .with_target(false)
    });

    if file_layer.is_none() && console_layer.is_none() {
        return Err(anyhow!("No logging output configured"));
    }

    registry
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log directory: {:?}", config.log_dir);
    info!("Log level: {}", config.level);
    Ok(())
}

/// Log build and host information for diagnostics
pub fn log_system_info() {
    info!("=== Guarantee Collector ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
}
