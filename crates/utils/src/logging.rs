//! provides logging helpers

use std::fs::OpenOptions;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber, writing to stderr
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// initiate the global tracing subscriber, appending to `log_file`.
///
/// Used by processes whose stdout belongs to a wire protocol. Falls back to
/// stderr when the file cannot be opened; the returned guard must be kept
/// alive until the process exits so buffered lines get flushed.
pub fn init_file<P: AsRef<Path>>(log_file: P) -> Option<WorkerGuard> {
    let file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file.as_ref())
    {
        Ok(file) => file,
        Err(e) => {
            init();
            tracing::warn!(
                "cannot open log file {:?}, logging to stderr: {e}",
                log_file.as_ref()
            );
            return None;
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(file);
    let fmt_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
    Some(guard)
}
