//! Structured logging for the localapp coordination core
//!
//! Every component logs through `tracing` macros with named fields
//! (`host`, `pid`, `lock`, ...). This crate installs the subscriber that
//! renders them.
//!
//! # Features
//!
//! - **Structured Format**: human-readable or JSON lines with RFC 3339 timestamps
//! - **Configurable Filtering**: `RUST_LOG` wins, the configured level applies otherwise
//! - **File Sink**: optional log file instead of stderr, for editor hosts that
//!   discard the extension's stderr
//! - **Idempotent Init**: a second initialisation warns instead of failing
//!
//! # Usage
//!
//! ```rust,ignore
//! use localapp_config::Config;
//!
//! let config = Config::from_env()?;
//! localapp_logging::init_logging(&config.logging, "localapp")?;
//!
//! tracing::info!(host = "example.org", "ensuring helper");
//! ```

use localapp_config::LoggingConfig;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{
    fmt::{time::ChronoUtc, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub mod error;

pub use error::{LoggingError, LoggingResult};

/// Initialize the global subscriber from configuration.
pub fn init_logging(config: &LoggingConfig, service_name: &str) -> LoggingResult<()> {
    let env_filter = build_filter(&config.level)?;

    let writer = match &config.log_file {
        Some(path) => BoxMakeWriter::new(Mutex::new(open_log_file(path)?)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(config.log_file.is_none())
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_level(true);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    match Registry::default().with(fmt_layer).with(env_filter).try_init() {
        Ok(()) => {
            tracing::info!(
                service = service_name,
                level = %config.level,
                json = config.json_format,
                "logging initialized"
            );
        }
        Err(err) => {
            tracing::warn!(
                "Logging already initialized, skipping duplicate subscriber: {}",
                err
            );
        }
    }

    Ok(())
}

/// Simplified initialization for tests and ad-hoc tools
pub fn init_console_logging(level: &str) -> LoggingResult<()> {
    let env_filter = build_filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_level(true);

    // Ignore error if a subscriber is already set; this happens in test environments.
    let _ = builder.try_init();

    Ok(())
}

fn build_filter(level: &str) -> LoggingResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .map_err(|err| LoggingError::Config(format!("invalid log level `{level}`: {err}")))
}

fn open_log_file(path: &Path) -> LoggingResult<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

// Re-export for convenience
pub use tracing::{debug, error, info, trace, warn};
