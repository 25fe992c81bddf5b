//! Tracing/logging initialization for the agent binary.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::Layer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Build the default filter directive for a log level from the config file.
///
/// Only the agent's own crates are raised to `level`; dependencies such as
/// `h2` and `tonic` stay at `warn` so a `debug` agent log is still readable.
pub fn default_filter(level: &str) -> String {
    format!("warn,kvmd_cloud_agent={level},kvmd_cloud_core={level}")
}

/// Writer for `log.file`: stdout for `-` (or empty), else the file opened
/// for appending.
pub fn log_writer(file: &str) -> Result<BoxMakeWriter> {
    if file.is_empty() || file == "-" {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    }
    let handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .map_err(|e| Error::Config(format!("Failed to open log file {file}: {e}")))?;
    Ok(BoxMakeWriter::new(Mutex::new(handle)))
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (see [`default_filter`]).
/// * `log` -- output options: JSON lines, target file, source locations.
pub fn init_tracing(default_filter: &str, log: &LogConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(log_writer(&log.file)?)
        .with_file(log.trace)
        .with_line_number(log.trace);
    let fmt = if log.json {
        fmt.json().boxed()
    } else {
        fmt.boxed()
    };
    tracing_subscriber::registry()
        .with(fmt)
        .with(env_filter)
        .init();
    Ok(())
}
