//! Logging setup: stderr output plus an optional daily-rolled log file.
//!
//! Filtering follows `RUST_LOG` and defaults to `info`.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Name prefix of rolled log files.
pub const LOG_FILE_PREFIX: &str = "intercache.log";

/// Keeps the file writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
  _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(log_dir: Option<&Path>) -> io::Result<LoggingGuard> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(io::stderr)
    .with_target(false);

  let (file_layer, file_guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .init();

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}
