use crate::types::TrustBundle;
use std::sync::{mpsc, Mutex};

/// Receives the post-refresh snapshot of a bundle after its new anchor set
/// has been committed. Delivery is fire-and-forget.
pub trait NotificationSink: Send + Sync {
  fn notify_bundle_refreshed(&self, bundle: &TrustBundle);
}

/// Emits a structured log event per refresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
  fn notify_bundle_refreshed(&self, bundle: &TrustBundle) {
    tracing::info!(
      bundle_id = bundle.id,
      name = %bundle.name,
      version = bundle.version,
      anchors = bundle.anchor_count(),
      "trust bundle changed"
    );
  }
}

/// Forwards snapshots to an in-process consumer, e.g. the component that
/// rebuilds certificate validators.
#[derive(Debug)]
pub struct ChannelSink {
  tx: Mutex<mpsc::Sender<TrustBundle>>,
}

impl ChannelSink {
  pub fn new(tx: mpsc::Sender<TrustBundle>) -> Self {
    Self { tx: Mutex::new(tx) }
  }

  pub fn channel() -> (Self, mpsc::Receiver<TrustBundle>) {
    let (tx, rx) = mpsc::channel();
    (Self::new(tx), rx)
  }
}

impl NotificationSink for ChannelSink {
  fn notify_bundle_refreshed(&self, bundle: &TrustBundle) {
    let Ok(tx) = self.tx.lock() else {
      tracing::warn!(bundle_id = bundle.id, "notification channel poisoned; event dropped");
      return;
    };
    if tx.send(bundle.clone()).is_err() {
      tracing::debug!(bundle_id = bundle.id, "no listener for bundle refresh events");
    }
  }
}
