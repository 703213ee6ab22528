//! Logging configuration for fleetsync.
//!
//! This module provides initialization and configuration for the tracing-based
//! logging system used throughout fleetsync. Output always goes to stderr;
//! a daily-rolling log file is added when a log directory is configured.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// File name prefix for rolling log files.
pub const LOG_FILE_PREFIX: &str = "fleetsync.log";

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Suppress all output except errors.
    Quiet,
    /// Normal output level (info and above).
    #[default]
    Normal,
    /// Verbose output (debug and above).
    Verbose,
    /// Very verbose output (trace level).
    Trace,
}

impl Verbosity {
    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

fn default_filter(verbosity: Verbosity) -> String {
    format!("fleetsync={}", verbosity.to_level_filter())
}

/// Initialize the logging system.
///
/// This should be called once at application startup. The logging level can be
/// controlled via:
/// 1. The `verbosity` parameter
/// 2. The `RUST_LOG` environment variable (takes precedence)
///
/// When `directory` is given, records are also written to a daily-rolling
/// file there. Keep the returned guard alive until exit so buffered lines
/// are flushed.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
///
/// # Examples
///
/// ```no_run
/// use fleetsync::{init_logging, logging::Verbosity};
///
/// let _guard = init_logging(Verbosity::Verbose, None).unwrap();
/// ```
pub fn init_logging(verbosity: Verbosity, directory: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // Allow RUST_LOG to override
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let (file_layer, guard) = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| Error::DirectoryCreate {
                path: dir.to_path_buf(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .with(file_layer);

    // Install the subscriber (ignore error if already set)
    let _ = subscriber.try_init();
    Ok(guard)
}

/// Initialize logging for tests.
///
/// This sets up a minimal logging configuration suitable for tests.
/// It only logs warnings and errors by default to keep test output clean.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_to_level() {
        assert_eq!(Verbosity::Quiet.to_level_filter(), Level::ERROR);
        assert_eq!(Verbosity::Normal.to_level_filter(), Level::INFO);
        assert_eq!(Verbosity::Verbose.to_level_filter(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.to_level_filter(), Level::TRACE);
    }

    #[test]
    fn test_verbosity_default() {
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(Verbosity::Normal), "fleetsync=INFO");
        assert_eq!(default_filter(Verbosity::Verbose), "fleetsync=DEBUG");
    }

    #[test]
    fn test_init_logging_stderr_only() {
        // The subscriber may already be set from a previous test; that is ignored.
        let guard = init_logging(Verbosity::Normal, None).unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn test_init_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let guard = init_logging(Verbosity::Quiet, Some(&logs)).unwrap();
        assert!(guard.is_some());
        assert!(logs.is_dir());
    }

    #[test]
    fn test_init_logging_bad_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "").unwrap();

        let result = init_logging(Verbosity::Normal, Some(&file.join("logs")));
        assert!(matches!(result, Err(Error::DirectoryCreate { .. })));
    }

    #[test]
    fn test_init_test_logging_does_not_panic() {
        init_test_logging();
    }
}
