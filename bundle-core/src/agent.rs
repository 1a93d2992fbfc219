use crate::admin;
use crate::config::Config;
use crate::notify::{LogSink, NotificationSink};
use crate::paths;
use crate::refresh::fetch::SourceFetcher;
use crate::refresh::parse::AnchorParser;
use crate::refresh::scheduler::RefreshScheduler;
use crate::refresh::RefreshOrchestrator;
use crate::store::{BundleStore, FileBundleStore};
use anyhow::Context;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Long-running refresh service: a file-backed store driven by the scheduler.
pub struct Agent {
  cfg: Config,
  orchestrator: Arc<RefreshOrchestrator>,
}

impl Agent {
  pub fn open(cfg: Config, base: &Path) -> anyhow::Result<Self> {
    let store = open_store(base)?;
    let added = admin::sync_from_config(store.as_ref(), &cfg).context("apply configured bundles")?;
    if added > 0 {
      tracing::info!(added, "configured bundles added to store");
    }

    let orchestrator = build_orchestrator(&cfg, store, Arc::new(LogSink))?;
    Ok(Self {
      cfg,
      orchestrator: Arc::new(orchestrator),
    })
  }

  pub fn run(&self, stop_rx: mpsc::Receiver<()>) -> anyhow::Result<()> {
    let bundles = self.orchestrator.store().list_bundles()?;
    tracing::info!(
      bundles = bundles.len(),
      enabled = bundles.iter().filter(|b| b.enabled).count(),
      "trust bundle service started"
    );

    let mut scheduler = RefreshScheduler::new(Arc::clone(&self.orchestrator));
    scheduler.run(stop_rx, Duration::from_millis(self.cfg.refresh.poll_interval_ms));

    tracing::info!("trust bundle service exiting");
    Ok(())
  }
}

pub fn open_store(base: &Path) -> anyhow::Result<Arc<dyn BundleStore>> {
  let path = paths::store_path(base);
  let store = FileBundleStore::open(&path)?;
  Ok(Arc::new(store))
}

pub fn build_orchestrator(
  cfg: &Config,
  store: Arc<dyn BundleStore>,
  sink: Arc<dyn NotificationSink>,
) -> anyhow::Result<RefreshOrchestrator> {
  let fetcher = SourceFetcher::new(&cfg.refresh)?;
  Ok(
    RefreshOrchestrator::new(store, Arc::new(fetcher), sink)
      .with_parser(Arc::new(AnchorParser::new(cfg.refresh.skip_expired_anchors)))
      .with_commit_retries(cfg.refresh.commit_retries),
  )
}
