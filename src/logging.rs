//! Tracing subscriber setup.
//!
//! Console output is either human-readable or JSON lines. When a log
//! directory is configured a second, non-blocking daily-rolling file sink is
//! added; its [`WorkerGuard`] must be held until shutdown so buffered lines
//! are flushed.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogSection};

/// File name prefix for rolling log files.
const LOG_FILE_PREFIX: &str = "webs.log";

/// Build the level filter. `RUST_LOG` wins over the configured level;
/// `verbose` bumps the configured level to `debug`.
pub fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose { "debug" } else { level };
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{}'", level))
}

/// Install the global subscriber.
pub fn init(config: &LogSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level, verbose)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    });

    let guard = match &config.dir {
        Some(dir) => {
            let (layer, guard) = file_layer(dir)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn file_layer(dir: &Path) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .boxed();
    Ok((layer, guard))
}
