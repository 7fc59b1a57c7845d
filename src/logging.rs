//! Structured logging: console output plus a daily rolling file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

pub const LOG_FILE_PREFIX: &str = "autoflow.log";

/// Keeps the file writer flushing; drop it only at process exit.
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Filter directive for the configured level. `RUST_LOG` wins when set.
pub fn filter_directive(level: &str, verbose: bool) -> String {
    let level = if verbose { "debug" } else { level };
    format!("warn,autoflow={}", level)
}

fn env_filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)))
}

/// Install the global subscriber.
///
/// Console output goes to stderr so command output on stdout stays clean.
/// The file layer always writes JSON. If a subscriber is already installed
/// (tests, embedding) the existing one is kept.
pub fn init(section: &LoggingSection, log_dir: &Path, verbose: bool) -> Result<LogGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console = if section.json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
            .with_filter(env_filter(&section.level, verbose))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(env_filter(&section.level, verbose))
            .boxed()
    };

    let file = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .with_filter(env_filter(&section.level, verbose));

    if tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already set, keeping it");
    }

    tracing::debug!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(LogGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("info", false), "warn,autoflow=info");
        assert_eq!(filter_directive("info", true), "warn,autoflow=debug");
        assert_eq!(filter_directive("trace", false), "warn,autoflow=trace");
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let _guard = init(&LoggingSection::default(), &log_dir, false).unwrap();
        assert!(log_dir.is_dir());
    }
}
