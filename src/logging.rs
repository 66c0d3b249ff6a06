// 📜 Logging - tracing subscriber setup
//
// RUST_LOG wins when set; otherwise `info`. Pretty output for a terminal,
// JSON lines for log aggregation. The optional file sink is always
// written without ANSI colors.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for development
    #[default]
    Pretty,
    /// JSON lines, for production
    Json,
}

/// Install the global subscriber. Call once, at startup.
pub fn init_logging(format: LogFormat, file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_writer = match file {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| SyncError::Config(format!("cannot open log file {:?}: {}", path, e)))?,
        )),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(io::stderr),
            )
            .with(file_writer.map(|w| fmt::layer().json().with_writer(w)))
            .try_init(),
    };

    installed.map_err(|e| SyncError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_config() {
        let json: LogFormat = serde_yaml::from_str("json").unwrap();
        let pretty: LogFormat = serde_yaml::from_str("pretty").unwrap();
        assert_eq!(json, LogFormat::Json);
        assert_eq!(pretty, LogFormat::Pretty);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
