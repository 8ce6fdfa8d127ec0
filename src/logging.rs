//! File-backed tracing setup for applications embedding the client.
//!
//! The library itself only emits `tracing` events; nothing is installed
//! unless the application calls [`init`].

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives, e.g. `toggl_cache=debug`.
pub const LOG_ENV: &str = "TOGGL_CACHE_LOG";

const LOG_FILE_PREFIX: &str = "toggl-cache.log";

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global subscriber writing daily-rotated log files into `dir`.
///
/// Keep the returned guard alive for as long as events should be flushed.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(env_filter())
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  tracing::debug!(dir = %dir.display(), "Logging initialized");
  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_creates_directory() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");

    // Another test may already own the global subscriber; the directory is
    // created either way.
    let _guard = init(&logs);
    assert!(logs.is_dir());
  }
}
