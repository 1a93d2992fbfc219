use crate::config::LoggingConfig;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "bundle-core.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
  FileOnly,
  FileAndStderr,
}

/// Installs the global subscriber: a daily-rolling file under `log_dir` and,
/// for foreground runs, stderr. `RUST_LOG` overrides the configured level.
pub fn init(log_dir: &Path, cfg: &LoggingConfig, output: Output) -> anyhow::Result<()> {
  fs::create_dir_all(log_dir)?;
  prune_old_logs(log_dir, cfg.retention_days);

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
  let _ = FILE_GUARD.set(guard);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(file_writer)
    .with_thread_names(true)
    .with_target(true);

  let stderr_layer = (output == Output::FileAndStderr).then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
  });

  tracing_subscriber::registry()
    .with(filter_for(&cfg.level))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

  Ok(())
}

fn filter_for(level: &str) -> EnvFilter {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn prune_old_logs(log_dir: &Path, retention_days: u64) {
  if retention_days == 0 {
    return;
  }

  let Some(cutoff) =
    SystemTime::now().checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
  else {
    return;
  };

  let Ok(entries) = fs::read_dir(log_dir) else {
    return;
  };

  for entry in entries.flatten() {
    let path = entry.path();
    if !is_rolled_log(&path) {
      continue;
    }
    let modified = entry.metadata().and_then(|m| m.modified());
    if matches!(modified, Ok(t) if t < cutoff) {
      let _ = fs::remove_file(&path);
    }
  }
}

fn is_rolled_log(path: &Path) -> bool {
  let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
    return false;
  };
  name == LOG_FILE_NAME
    || name
      .strip_prefix(LOG_FILE_NAME)
      .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_bundle_logs_are_candidates() {
    assert!(is_rolled_log(Path::new("/logs/bundle-core.log")));
    assert!(is_rolled_log(Path::new("/logs/bundle-core.log.2026-10-01")));
    assert!(!is_rolled_log(Path::new("/logs/bundle-core.logger")));
    assert!(!is_rolled_log(Path::new("/logs/other.log")));
  }

  #[test]
  fn zero_retention_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("bundle-core.log.2000-01-01");
    fs::write(&old, b"x").unwrap();
    prune_old_logs(dir.path(), 0);
    assert!(old.exists());
  }

  #[test]
  fn fresh_logs_survive_pruning() {
    let dir = tempfile::tempdir().unwrap();
    let fresh = dir.path().join("bundle-core.log.2026-10-18");
    let unrelated = dir.path().join("notes.txt");
    fs::write(&fresh, b"x").unwrap();
    fs::write(&unrelated, b"x").unwrap();
    prune_old_logs(dir.path(), 7);
    assert!(fresh.exists());
    assert!(unrelated.exists());
  }
}
