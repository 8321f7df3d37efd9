//! Logging setup.
//!
//! Library code logs through the `log` facade and opens `tracing` spans
//! around pipeline phases. [`init`] installs one global subscriber that
//! receives both, filtered by `RUST_LOG` (default `info`).

use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::ManuscriptError;

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Builds the env filter, defaulting to `info` when `RUST_LOG` is unset or invalid.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber and bridges `log` records into it.
///
/// Fails if a global subscriber or logger is already installed.
pub fn init(format: LogFormat) -> Result<(), ManuscriptError> {
    tracing_log::LogTracer::init().map_err(|e| ManuscriptError::Logging(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match format {
        LogFormat::Plain => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| ManuscriptError::Logging(e.to_string()))
}
