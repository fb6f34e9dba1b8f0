use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "YOMU_LOG";
const LOG_FILE: &str = "yomu.log";

/// Initialize the tracing subscriber.
///
/// Logs go to `yomu.log` in the data directory so they never interleave with
/// command output. If that directory cannot be created, logs go to stderr.
/// The level comes from `YOMU_LOG` (default `warn`).
///
/// Keep the returned guard alive until exit; dropping it flushes the file.
pub fn init() -> Result<Option<WorkerGuard>> {
  match log_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn log_dir() -> Option<PathBuf> {
  let dir = dirs::data_dir()?.join("yomu");
  std::fs::create_dir_all(&dir).ok()?;
  Some(dir)
}
