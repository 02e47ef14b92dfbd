//! Structured logging setup for the media sync service

use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Unknown log format '{0}'")]
    UnknownFormat(String),

    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production)
    #[default]
    Json,
    /// Human-readable (development)
    Console,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "pretty" => Ok(LogFormat::Console),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

/// `RUST_LOG` wins over the configured default level
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the requested format
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> Result<(), LoggingError> {
    match format {
        LogFormat::Json => init_logging(service_name, default_level),
        LogFormat::Console => init_console_logging(service_name, default_level),
    }
}

/// Initialize structured JSON logging
///
/// This sets up:
/// - JSON formatted logs with file and line
/// - Environment-based log level filtering
/// - Thread names, to tell the network task from the processing tick
pub fn init_logging(service_name: &str, default_level: &str) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::info!(service = service_name, "Logging initialized");
    Ok(())
}

/// Initialize human-readable console logging
pub fn init_console_logging(service_name: &str, default_level: &str) -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::info!(service = service_name, "Console logging initialized");
    Ok(())
}
