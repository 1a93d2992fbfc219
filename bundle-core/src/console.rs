use crate::admin;
use crate::agent;
use crate::config::Config;
use crate::notify::LogSink;
use crate::refresh::Outcome;
use crate::store::BundleStore;
use crate::types::{now_unix_s, TrustBundle};
use anyhow::Context;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub enum ConsoleAction {
  RunAgent,
  ExitOk,
}

pub fn run_console_command(cfg: &Config, base: &Path, args: &[String]) -> anyhow::Result<ConsoleAction> {
  let args = strip_console_flag(args);

  if args.iter().any(|a| a == "--help" || a == "-h") {
    print_help();
    return Ok(ConsoleAction::ExitOk);
  }

  let Some(i) = args.iter().position(|a| a.starts_with("--")) else {
    return Ok(ConsoleAction::RunAgent);
  };
  let tail = &args[i + 1..];

  let store = agent::open_store(base)?;
  admin::sync_from_config(store.as_ref(), cfg).context("apply configured bundles")?;

  match args[i].as_str() {
    "--status" => print_status(store.as_ref())?,
    "--refresh" => {
      let bundle = named_bundle(store.as_ref(), tail, "--refresh <name>")?;
      let orchestrator = agent::build_orchestrator(cfg, store, Arc::new(LogSink))?;
      let outcome = orchestrator.refresh(bundle.id)?;
      println!("{}: {}", bundle.name, describe_outcome(&outcome));
    }
    "--set-signing-cert" => {
      let bundle = named_bundle(store.as_ref(), tail, "--set-signing-cert <name> <file>")?;
      let file = tail
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("expected: --set-signing-cert <name> <file>"))?;
      let credential = fs::read(file).with_context(|| format!("read {file}"))?;
      admin::update_signing_certificate(store.as_ref(), bundle.id, &credential)?;
      println!("Signing certificate updated for {}; the next refresh verifies against it.", bundle.name);
    }
    "--clear-signing-cert" => {
      let bundle = named_bundle(store.as_ref(), tail, "--clear-signing-cert <name>")?;
      admin::clear_signing_certificate(store.as_ref(), bundle.id)?;
      println!("Signing certificate cleared for {}.", bundle.name);
    }
    "--enable" | "--disable" => {
      let enable = args[i] == "--enable";
      let bundle = named_bundle(store.as_ref(), tail, "--enable|--disable <name>")?;
      admin::set_enabled(store.as_ref(), bundle.id, enable)?;
      println!(
        "{} {}.",
        bundle.name,
        if enable { "enabled" } else { "disabled" }
      );
    }
    "--set-interval" => {
      let bundle = named_bundle(store.as_ref(), tail, "--set-interval <name> <seconds>")?;
      let secs = tail
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("expected: --set-interval <name> <seconds>"))?;
      let secs: u64 = secs
        .parse()
        .with_context(|| format!("invalid interval {secs:?}"))?;
      admin::set_refresh_interval(store.as_ref(), bundle.id, secs)?;
      println!("{} now refreshes every {secs}s.", bundle.name);
    }
    "--delete" => {
      if tail.is_empty() {
        anyhow::bail!("expected: --delete <name> [<name>...]");
      }
      let mut ids = Vec::with_capacity(tail.len());
      for name in tail {
        ids.push(store.get_bundle_by_name(name)?.id);
      }
      let removed = admin::delete_bundles(store.as_ref(), &ids)?;
      println!("Deleted {removed} bundle(s).");
    }
    other => {
      eprintln!("Unknown command `{other}`.");
      print_help();
    }
  }

  Ok(ConsoleAction::ExitOk)
}

fn named_bundle(
  store: &dyn BundleStore,
  tail: &[String],
  usage: &str,
) -> anyhow::Result<TrustBundle> {
  let name = tail
    .first()
    .ok_or_else(|| anyhow::anyhow!("expected: {usage}"))?;
  Ok(store.get_bundle_by_name(name)?)
}

fn print_status(store: &dyn BundleStore) -> anyhow::Result<()> {
  let bundles = store.list_bundles()?;
  if bundles.is_empty() {
    println!("No trust bundles configured.");
    return Ok(());
  }

  let now = now_unix_s();
  for b in &bundles {
    println!("{}", status_line(b, now));
  }
  Ok(())
}

fn status_line(b: &TrustBundle, now: u64) -> String {
  let state = match b.last_error {
    Some(code) => code.as_str(),
    None => "NEVER_REFRESHED",
  };
  let success = match b.last_success_at {
    Some(at) => format!("{}s ago", now.saturating_sub(at)),
    None => "never".to_string(),
  };

  format!(
    "#{} {} [{}] state={} version={} anchors={} last_success={} signed={} interval={}s checksum={}",
    b.id,
    b.name,
    if b.enabled { "enabled" } else { "disabled" },
    state,
    b.version,
    b.anchor_count(),
    success,
    b.signing_certificate.is_some(),
    b.refresh_interval_secs,
    b.checksum.as_deref().map(|c| &c[..c.len().min(12)]).unwrap_or("-"),
  )
}

fn describe_outcome(outcome: &Outcome) -> String {
  match outcome {
    Outcome::Refreshed {
      version,
      anchor_count,
    } => format!("SUCCESS (version {version}, {anchor_count} anchors)"),
    Outcome::Failed(code) => format!("{code} (previous anchors kept)"),
    Outcome::Disabled => "bundle is disabled; nothing done".to_string(),
    Outcome::Discarded => "bundle changed during refresh; result discarded".to_string(),
    Outcome::Superseded => "a newer refresh already committed".to_string(),
  }
}

fn strip_console_flag(args: &[String]) -> Vec<String> {
  args
    .iter()
    .skip(1)
    .filter(|a| a.as_str() != "--console")
    .cloned()
    .collect()
}

fn print_help() {
  println!("bundle-core v{} (console mode)", env!("CARGO_PKG_VERSION"));
  println!("Commands:");
  println!("  (none)                               run the refresh scheduler until ctrl-c");
  println!("  --status");
  println!("  --refresh <name>");
  println!("  --set-signing-cert <name> <file>     PEM, DER or PKCS#12 (no password)");
  println!("  --clear-signing-cert <name>");
  println!("  --enable <name>");
  println!("  --disable <name>");
  println!("  --set-interval <name> <seconds>");
  println!("  --delete <name> [<name>...]");
}
