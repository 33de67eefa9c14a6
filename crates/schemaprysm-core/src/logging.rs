//! Tracing subscriber setup
//!
//! Installs a global `tracing` subscriber from [`LoggingConfig`]. `RUST_LOG`
//! directives override the configured level.

use anyhow::{Context, Result};
use schemaprysm_config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the event filter for a configured level
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let default_level: LevelFilter = level
        .parse()
        .with_context(|| format!("invalid log level '{}'", level))?;
    Ok(EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy())
}

/// Install the global subscriber
///
/// Logs go to stderr, or are appended to `config.file` when set. Fails if a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create log directory {}", parent.display())
                    })?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init(),
    };
    installed.context("a global tracing subscriber is already installed")
}
