//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Log file name prefix inside the configured directory
const LOG_FILE_PREFIX: &str = "portal-sync.log";

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. With a log
/// directory configured, events go to a daily-rolling file and the returned
/// guard must be held until exit so buffered lines are flushed.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
  let filter = build_filter(&config.level);

  match &config.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

fn build_filter(level: &str) -> EnvFilter {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("warn"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_level_falls_back() {
    // Must not panic on a malformed directive
    let _ = build_filter("portal_sync=[");
    let _ = build_filter("debug");
  }
}
