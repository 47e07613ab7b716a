//! Observability: structured logging and metrics.

mod logging;
pub mod metrics;

pub use logging::{LogFormat, LoggingConfig};

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes logging from environment variables.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed or the log
/// file cannot be opened.
pub fn init_from_env() -> Result<()> {
    init(LoggingConfig::from_env())
}

/// Installs the global `tracing` subscriber.
///
/// Events go to stderr unless [`LoggingConfig::file`] is set; ANSI colors are
/// only used on stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed or the log
/// file cannot be opened.
pub fn init(config: LoggingConfig) -> Result<()> {
    let (writer, ansi) = match &config.file {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(true);
    let fmt_layer = match config.format {
        LogFormat::Json => fmt_layer.json().with_current_span(true).boxed(),
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(config.filter)
        .try_init()
        .map_err(|e| Error::OperationFailed {
            operation: "observability_init".to_string(),
            cause: e.to_string(),
        })
}

/// Opens a log file for appending, creating parent directories.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: "create_log_dir".to_string(),
            cause: format!("{}: {e}", parent.display()),
        })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::OperationFailed {
            operation: "open_log_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_log_file_creates_parents_and_appends() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("alertgate.log");
        open_log_file(&path).unwrap().write_all(b"first\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_open_log_file_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let err = open_log_file(&blocker.join("alertgate.log")).unwrap_err();
        assert!(matches!(err, Error::OperationFailed { ref operation, .. } if operation == "create_log_dir"));
    }

    #[test]
    fn test_second_init_fails() {
        // The first call may lose to another test; the second never wins.
        let _ = init(LoggingConfig::new(LogFormat::Pretty, "alertgate=debug"));
        let second = init(LoggingConfig::new(LogFormat::Json, "alertgate=debug"));
        assert!(matches!(second, Err(Error::OperationFailed { .. })));
    }
}
