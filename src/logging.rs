//! Tracing setup for the `tandem` binary.
//!
//! Two layers share one `EnvFilter` (`RUST_LOG`, defaulting to `info`, or
//! `debug` with `--verbose`):
//! - compact human-readable lines on stderr
//! - a daily-rolling file under `.tandem/logs/` without ANSI colours
//!
//! The iteration audit trail (`audit`) is separate and always written.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "tandem.log";

/// Install the global subscriber.
///
/// With `log_dir` set, the returned guard must be held until exit so
/// buffered file lines are flushed. Later calls are ignored.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    match log_dir.and_then(|dir| std::fs::create_dir_all(dir).ok().map(|_| dir)) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .try_init()
                .ok();
            None
        }
    }
}
