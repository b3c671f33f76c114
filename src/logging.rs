use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber: a daily-rolling log file plus warnings on
/// stderr. Keep the returned guard alive until exit or buffered lines are
/// lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let dir = config
    .directory
    .clone()
    .or_else(default_log_dir)
    .ok_or_else(|| eyre!("Could not determine log directory; set logging.directory"))?;

  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "mutq.log"));

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.filter))
    .map_err(|e| eyre!("Invalid logging.filter {:?}: {}", config.filter, e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  tracing::debug!(directory = %dir.display(), "logging initialized");
  Ok(guard)
}

fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|dir| dir.join("mutq").join("logs"))
}
