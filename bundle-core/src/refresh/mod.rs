//! Fetch, verify, parse and install pipeline for a single trust bundle.
//!
//! A refresh either installs a complete new anchor set (and then notifies
//! listeners exactly once) or records a failure code and leaves the previous
//! anchor set in place. Refreshes of the same bundle are serialized through
//! a per-id lock; stale attempts are dropped using a dispatch ticket.

use crate::error::BundleError;
use crate::notify::NotificationSink;
use crate::store::BundleStore;
use crate::types::{now_unix_s, sha256_hex, BundleId, BundleRefreshError, TrustBundle};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub mod envelope;
pub mod fetch;
pub mod parse;
pub mod scheduler;
pub mod verify;

use fetch::PayloadFetcher;
use parse::{AnchorCertificate, AnchorParser, PayloadParser};
use verify::{CertificateVerifier, PayloadVerifier};

const DEFAULT_COMMIT_RETRIES: u32 = 3;

/// Result of one refresh call for an existing bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Refreshed { version: u64, anchor_count: usize },
  Failed(BundleRefreshError),
  /// The bundle is disabled; nothing was attempted.
  Disabled,
  /// The bundle was deleted or disabled while the attempt was in flight.
  Discarded,
  /// An attempt dispatched later has already committed.
  Superseded,
}

impl Outcome {
  /// The code this call persisted, if it persisted one.
  pub fn recorded(&self) -> Option<BundleRefreshError> {
    match self {
      Outcome::Refreshed { .. } => Some(BundleRefreshError::Success),
      Outcome::Failed(code) => Some(*code),
      _ => None,
    }
  }
}

/// Dispatch order of a refresh attempt. Taken before waiting on the
/// per-bundle lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshTicket(u64);

#[derive(Debug, Default)]
struct SlotState {
  committed: Option<RefreshTicket>,
}

#[derive(Debug, Default)]
struct BundleLocks {
  slots: Mutex<HashMap<BundleId, Arc<Mutex<SlotState>>>>,
}

impl BundleLocks {
  fn slot(&self, id: BundleId) -> Arc<Mutex<SlotState>> {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slots.entry(id).or_default())
  }

  fn remove(&self, id: BundleId) {
    self
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&id);
  }
}

struct Install {
  anchors: Vec<AnchorCertificate>,
  checksum: String,
}

pub struct RefreshOrchestrator {
  store: Arc<dyn BundleStore>,
  fetcher: Arc<dyn PayloadFetcher>,
  verifier: Arc<dyn PayloadVerifier>,
  parser: Arc<dyn PayloadParser>,
  sink: Arc<dyn NotificationSink>,
  locks: BundleLocks,
  tickets: AtomicU64,
  commit_retries: u32,
}

impl RefreshOrchestrator {
  pub fn new(
    store: Arc<dyn BundleStore>,
    fetcher: Arc<dyn PayloadFetcher>,
    sink: Arc<dyn NotificationSink>,
  ) -> Self {
    Self {
      store,
      fetcher,
      verifier: Arc::new(CertificateVerifier),
      parser: Arc::new(AnchorParser::default()),
      sink,
      locks: BundleLocks::default(),
      tickets: AtomicU64::new(0),
      commit_retries: DEFAULT_COMMIT_RETRIES,
    }
  }

  pub fn with_verifier(mut self, verifier: Arc<dyn PayloadVerifier>) -> Self {
    self.verifier = verifier;
    self
  }

  pub fn with_parser(mut self, parser: Arc<dyn PayloadParser>) -> Self {
    self.parser = parser;
    self
  }

  pub fn with_commit_retries(mut self, retries: u32) -> Self {
    self.commit_retries = retries;
    self
  }

  pub fn store(&self) -> &Arc<dyn BundleStore> {
    &self.store
  }

  pub fn ticket(&self) -> RefreshTicket {
    RefreshTicket(self.tickets.fetch_add(1, Ordering::SeqCst) + 1)
  }

  /// Drops per-bundle bookkeeping for a deleted bundle.
  pub fn forget(&self, id: BundleId) {
    self.locks.remove(id);
  }

  pub fn refresh(&self, id: BundleId) -> Result<Outcome, BundleError> {
    let ticket = self.ticket();
    self.refresh_with_ticket(id, ticket)
  }

  /// Runs one attempt. Only `NotFound` (and store backend errors while
  /// loading the bundle) are returned as errors; every pipeline failure is
  /// recorded on the bundle and reported through the outcome.
  pub fn refresh_with_ticket(
    &self,
    id: BundleId,
    ticket: RefreshTicket,
  ) -> Result<Outcome, BundleError> {
    let slot = self.locks.slot(id);
    let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);

    if state.committed.is_some_and(|c| c > ticket) {
      tracing::debug!(bundle_id = id, "newer refresh already committed; dropping attempt");
      return Ok(Outcome::Superseded);
    }

    let bundle = self.store.get_bundle(id)?;
    if !bundle.enabled {
      tracing::debug!(bundle_id = id, name = %bundle.name, "bundle disabled; refresh skipped");
      return Ok(Outcome::Disabled);
    }

    let attempt_at = now_unix_s();
    match self.run_pipeline(&bundle, attempt_at) {
      Ok(install) => Ok(self.commit(&bundle, install, attempt_at, ticket, &mut state)),
      Err(code) => Ok(self.record_failure(&bundle, attempt_at, code)),
    }
  }

  fn run_pipeline(&self, bundle: &TrustBundle, now: u64) -> Result<Install, BundleRefreshError> {
    let fetched = match contain(bundle, "fetch", || self.fetcher.fetch(bundle))? {
      Ok(v) => v,
      Err(e) => {
        tracing::warn!(
          bundle_id = bundle.id,
          name = %bundle.name,
          reason = %short_error(&e),
          "trust bundle fetch failed"
        );
        return Err(BundleRefreshError::FetchFailure);
      }
    };

    let envelope = envelope::signed_data(&fetched.content).filter(|e| e.is_signed());

    if let Some(cert) = bundle.signing_certificate.as_deref() {
      let verified = contain(bundle, "verify", || match &envelope {
        Some(envelope) => self.verifier.verify_envelope(envelope, cert),
        None => self
          .verifier
          .verify(&fetched.content, fetched.signature.as_deref(), cert),
      })?;
      if let Err(e) = verified {
        tracing::warn!(
          bundle_id = bundle.id,
          name = %bundle.name,
          reason = %e,
          "trust bundle signature rejected"
        );
        return Err(BundleRefreshError::SignatureFailure);
      }
    }

    let body = match &envelope {
      None => fetched.content.as_slice(),
      Some(envelope) => match envelope.content.as_deref() {
        Some(content) => content,
        None => {
          tracing::warn!(
            bundle_id = bundle.id,
            name = %bundle.name,
            "signed envelope carries no content"
          );
          return Err(BundleRefreshError::ParseFailure);
        }
      },
    };

    let parsed = match contain(bundle, "parse", || self.parser.parse(body, now))? {
      Ok(p) => p,
      Err(e) => {
        tracing::warn!(
          bundle_id = bundle.id,
          name = %bundle.name,
          reason = %e,
          "trust bundle payload unusable"
        );
        return Err(BundleRefreshError::ParseFailure);
      }
    };

    for skipped in &parsed.skipped {
      tracing::debug!(
        bundle_id = bundle.id,
        entry = skipped.index,
        reason = %skipped.reason,
        "bundle entry skipped"
      );
    }
    if !parsed.skipped.is_empty() {
      tracing::warn!(
        bundle_id = bundle.id,
        name = %bundle.name,
        skipped = parsed.skipped.len(),
        accepted = parsed.anchors.len(),
        "some bundle entries were skipped"
      );
    }

    Ok(Install {
      anchors: parsed.anchors,
      checksum: sha256_hex(&fetched.content),
    })
  }

  fn commit(
    &self,
    bundle: &TrustBundle,
    install: Install,
    attempt_at: u64,
    ticket: RefreshTicket,
    state: &mut SlotState,
  ) -> Outcome {
    let id = bundle.id;
    let anchors: Vec<_> = install
      .anchors
      .into_iter()
      .map(|a| a.into_anchor(id))
      .collect();
    let mut expected = bundle.version;

    for _ in 0..=self.commit_retries {
      let result = self.store.replace_anchors(
        id,
        expected,
        attempt_at,
        anchors.clone(),
        install.checksum.clone(),
      );

      match result {
        Ok(committed) => {
          state.committed = Some(ticket);
          tracing::info!(
            bundle_id = id,
            name = %committed.name,
            version = committed.version,
            anchors = committed.anchor_count(),
            "trust bundle refreshed"
          );
          let outcome = Outcome::Refreshed {
            version: committed.version,
            anchor_count: committed.anchor_count(),
          };
          self.notify(committed);
          return outcome;
        }
        Err(BundleError::VersionConflict { current, .. }) => {
          tracing::debug!(bundle_id = id, expected, current, "anchor commit raced; re-reading");
          let latest = match self.store.get_bundle(id) {
            Ok(b) => b,
            Err(BundleError::NotFound(_)) => return self.discarded(bundle, "deleted"),
            Err(e) => {
              tracing::error!(bundle_id = id, error = %e, "re-reading bundle after conflict failed");
              return self.record_failure(bundle, attempt_at, BundleRefreshError::UnknownFailure);
            }
          };
          if !latest.enabled {
            return self.discarded(bundle, "disabled");
          }
          if latest.checksum.as_deref() == Some(install.checksum.as_str()) {
            tracing::debug!(bundle_id = id, "identical anchor set already committed");
            return Outcome::Superseded;
          }
          expected = latest.version;
        }
        Err(BundleError::NotFound(_)) => return self.discarded(bundle, "deleted"),
        Err(BundleError::Disabled(_)) => return self.discarded(bundle, "disabled"),
        Err(e) => {
          tracing::error!(bundle_id = id, error = %e, "anchor commit failed");
          return self.record_failure(bundle, attempt_at, BundleRefreshError::UnknownFailure);
        }
      }
    }

    tracing::warn!(
      bundle_id = id,
      retries = self.commit_retries,
      "anchor commit kept conflicting; giving up"
    );
    self.record_failure(bundle, attempt_at, BundleRefreshError::UnknownFailure)
  }

  fn notify(&self, committed: TrustBundle) {
    let sent = panic::catch_unwind(AssertUnwindSafe(|| {
      self.sink.notify_bundle_refreshed(&committed)
    }));
    if sent.is_err() {
      tracing::error!(bundle_id = committed.id, "notification sink panicked");
    }
  }

  fn record_failure(
    &self,
    bundle: &TrustBundle,
    attempt_at: u64,
    code: BundleRefreshError,
  ) -> Outcome {
    match self.store.record_refresh_outcome(bundle.id, attempt_at, code) {
      Ok(()) => Outcome::Failed(code),
      Err(BundleError::NotFound(_)) => self.discarded(bundle, "deleted"),
      Err(BundleError::Disabled(_)) => self.discarded(bundle, "disabled"),
      Err(e) => {
        tracing::error!(
          bundle_id = bundle.id,
          code = %code,
          error = %e,
          "could not record refresh outcome"
        );
        Outcome::Failed(code)
      }
    }
  }

  fn discarded(&self, bundle: &TrustBundle, why: &str) -> Outcome {
    tracing::info!(
      bundle_id = bundle.id,
      name = %bundle.name,
      why,
      "refresh result discarded"
    );
    Outcome::Discarded
  }
}

/// Runs a collaborator call, turning a panic into `UNKNOWN_FAILURE`.
fn contain<T>(
  bundle: &TrustBundle,
  step: &str,
  f: impl FnOnce() -> T,
) -> Result<T, BundleRefreshError> {
  panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
    tracing::error!(bundle_id = bundle.id, step, "refresh step panicked");
    BundleRefreshError::UnknownFailure
  })
}

fn short_error(e: &anyhow::Error) -> String {
  let text = format!("{e:#}");
  let count = text.chars().count();
  if count <= 180 {
    return text;
  }
  let prefix: String = text.chars().take(180).collect();
  format!("{prefix}...")
}
