pub mod admin;
pub mod agent;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod notify;
pub mod paths;
pub mod refresh;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutil;

use std::sync::mpsc;

/// Foreground mode: logs to stderr as well, runs one console command or, with
/// none given, the scheduler until ctrl-c.
pub fn run_console(args: &[String]) -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let cfg = config::load_or_create_default(&paths::config_path(&base))?;
  logging::init(&paths::logs_dir(&base), &cfg.logging, logging::Output::FileAndStderr)?;

  match console::run_console_command(&cfg, &base, args)? {
    console::ConsoleAction::ExitOk => return Ok(()),
    console::ConsoleAction::RunAgent => {}
  }

  tracing::info!(base = %base.display(), "starting trust bundle refresh (console mode)");
  run_until_stopped(cfg, &base, true)
}

/// Daemon mode: file logging only, scheduler runs until SIGINT/SIGTERM.
pub fn run_service() -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let cfg = config::load_or_create_default(&paths::config_path(&base))?;
  logging::init(&paths::logs_dir(&base), &cfg.logging, logging::Output::FileOnly)?;

  tracing::info!(base = %base.display(), "starting trust bundle refresh service");
  run_until_stopped(cfg, &base, false)
}

fn run_until_stopped(cfg: config::Config, base: &std::path::Path, console: bool) -> anyhow::Result<()> {
  let agent = agent::Agent::open(cfg, base)?;
  let (stop_tx, stop_rx) = mpsc::channel::<()>();

  ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  })?;

  agent.run(stop_rx)?;
  tracing::info!(console, "trust bundle refresh stopped");
  Ok(())
}
