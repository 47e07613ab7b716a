//! Structured logging configuration.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "alertgate=info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name; anything but `json` is pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Event filter.
    pub filter: EnvFilter,
    /// Optional file to append to instead of stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds logging configuration from environment variables.
    ///
    /// `ALERTGATE_LOG` (falling back to `RUST_LOG`) sets the filter,
    /// `ALERTGATE_LOG_FORMAT` the format and `ALERTGATE_LOG_FILE` the file.
    #[must_use]
    pub fn from_env() -> Self {
        let directives = std::env::var("ALERTGATE_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        Self {
            format: std::env::var("ALERTGATE_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            filter: parse_filter(&directives),
            file: std::env::var("ALERTGATE_LOG_FILE").ok().map(PathBuf::from),
        }
    }

    /// Builds a configuration with the given format and filter directives.
    #[must_use]
    pub fn new(format: LogFormat, directives: &str) -> Self {
        Self {
            format,
            filter: parse_filter(directives),
            file: None,
        }
    }
}

fn parse_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("alertgate: invalid log filter '{directives}': {e}; using {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}
