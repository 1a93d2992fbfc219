use super::{Outcome, RefreshOrchestrator};
use crate::types::{now_unix_ms, BundleId, TrustBundle};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
  pub started: usize,
  pub skipped_busy: usize,
}

/// Drives the orchestrator for every enabled bundle on its own interval.
///
/// Each due bundle gets its own worker thread. A bundle whose previous
/// refresh is still running when it comes due again is skipped for that
/// interval rather than queued.
pub struct RefreshScheduler {
  orchestrator: Arc<RefreshOrchestrator>,
  schedule: HashMap<BundleId, Slot>,
  in_flight: Arc<Mutex<HashSet<BundleId>>>,
  workers: Vec<JoinHandle<()>>,
}

impl RefreshScheduler {
  pub fn new(orchestrator: Arc<RefreshOrchestrator>) -> Self {
    Self {
      orchestrator,
      schedule: HashMap::new(),
      in_flight: Arc::new(Mutex::new(HashSet::new())),
      workers: Vec::new(),
    }
  }

  pub fn run(&mut self, stop_rx: mpsc::Receiver<()>, poll: Duration) {
    tracing::info!(
      poll_ms = poll.as_millis() as u64,
      "refresh scheduler started"
    );

    loop {
      self.tick();
      match stop_rx.recv_timeout(poll) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        Err(mpsc::RecvTimeoutError::Timeout) => {}
      }
    }

    let pending = self.in_flight().len();
    if pending > 0 {
      tracing::info!(pending, "waiting for in-flight refreshes");
    }
    self.wait_idle();
    tracing::info!("refresh scheduler stopped");
  }

  pub fn tick(&mut self) -> TickReport {
    self.tick_at(now_unix_ms())
  }

  pub fn tick_at(&mut self, now_ms: u64) -> TickReport {
    self.reap_finished();

    let bundles = match self.orchestrator.store().list_bundles() {
      Ok(b) => b,
      Err(e) => {
        tracing::error!(error = %e, "listing bundles failed; tick skipped");
        return TickReport::default();
      }
    };

    self.drop_inactive(&bundles);

    let mut report = TickReport::default();
    for bundle in bundles.iter().filter(|b| b.enabled) {
      let interval_ms = interval_ms(bundle);
      let slot = self.schedule.entry(bundle.id).or_insert_with(|| Slot {
        due_ms: first_due_ms(bundle, now_ms),
        interval_ms,
      });
      if slot.interval_ms != interval_ms {
        tracing::info!(
          bundle_id = bundle.id,
          old_interval_ms = slot.interval_ms,
          interval_ms,
          "refresh interval changed; rescheduled"
        );
        slot.reschedule(interval_ms);
      }
      if now_ms < slot.due_ms {
        continue;
      }
      slot.due_ms = now_ms.saturating_add(interval_ms);

      if self.is_in_flight(bundle.id) {
        tracing::debug!(
          bundle_id = bundle.id,
          name = %bundle.name,
          "previous refresh still running; tick skipped"
        );
        report.skipped_busy += 1;
        continue;
      }

      if self.dispatch(bundle) {
        report.started += 1;
      }
    }

    if report.started > 0 || report.skipped_busy > 0 {
      tracing::debug!(
        started = report.started,
        skipped_busy = report.skipped_busy,
        "scheduler tick"
      );
    }
    report
  }

  /// Removes a bundle from the schedule right away instead of on the next
  /// tick.
  pub fn forget(&mut self, id: BundleId) {
    self.schedule.remove(&id);
  }

  pub fn in_flight(&self) -> Vec<BundleId> {
    let mut ids: Vec<_> = self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .copied()
      .collect();
    ids.sort_unstable();
    ids
  }

  pub fn scheduled(&self) -> usize {
    self.schedule.len()
  }

  pub fn next_due_ms(&self, id: BundleId) -> Option<u64> {
    self.schedule.get(&id).map(|s| s.due_ms)
  }

  pub fn wait_idle(&mut self) {
    for handle in self.workers.drain(..) {
      if handle.join().is_err() {
        tracing::error!("refresh worker terminated abnormally");
      }
    }
  }

  fn drop_inactive(&mut self, bundles: &[TrustBundle]) {
    let enabled: HashSet<BundleId> = bundles.iter().filter(|b| b.enabled).map(|b| b.id).collect();
    let present: HashSet<BundleId> = bundles.iter().map(|b| b.id).collect();

    let orchestrator = &self.orchestrator;
    self.schedule.retain(|id, _| {
      if !present.contains(id) {
        tracing::info!(bundle_id = *id, "bundle deleted; unscheduled");
        orchestrator.forget(*id);
        return false;
      }
      if !enabled.contains(id) {
        tracing::info!(bundle_id = *id, "bundle disabled; unscheduled");
        return false;
      }
      true
    });
  }

  fn is_in_flight(&self, id: BundleId) -> bool {
    self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(&id)
  }

  fn dispatch(&mut self, bundle: &TrustBundle) -> bool {
    let id = bundle.id;
    let ticket = self.orchestrator.ticket();
    let guard = InFlightGuard::mark(Arc::clone(&self.in_flight), id);
    let orchestrator = Arc::clone(&self.orchestrator);

    let spawned = thread::Builder::new()
      .name(format!("bundle-refresh-{id}"))
      .spawn(move || {
        let _guard = guard;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
          orchestrator.refresh_with_ticket(id, ticket)
        }));
        match result {
          Ok(Ok(outcome)) => log_outcome(id, &outcome),
          Ok(Err(e)) => tracing::info!(bundle_id = id, error = %e, "scheduled refresh not run"),
          Err(_) => tracing::error!(bundle_id = id, "scheduled refresh panicked"),
        }
      });

    match spawned {
      Ok(handle) => {
        self.workers.push(handle);
        true
      }
      Err(e) => {
        tracing::error!(bundle_id = id, error = %e, "could not spawn refresh worker");
        false
      }
    }
  }

  fn reap_finished(&mut self) {
    let (done, running): (Vec<_>, Vec<_>) = self.workers.drain(..).partition(|h| h.is_finished());
    self.workers = running;
    for handle in done {
      let _ = handle.join();
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
  due_ms: u64,
  interval_ms: u64,
}

impl Slot {
  /// Keeps the start of the current interval and applies the new length
  /// from there. A shortened interval that already elapsed is due at once.
  fn reschedule(&mut self, interval_ms: u64) {
    let started_ms = self.due_ms.saturating_sub(self.interval_ms);
    self.due_ms = started_ms.saturating_add(interval_ms);
    self.interval_ms = interval_ms;
  }
}

fn interval_ms(bundle: &TrustBundle) -> u64 {
  bundle.refresh_interval_secs.saturating_mul(1000).max(1)
}

fn first_due_ms(bundle: &TrustBundle, now_ms: u64) -> u64 {
  match bundle.last_attempt_at {
    Some(at) => at
      .saturating_add(bundle.refresh_interval_secs)
      .saturating_mul(1000)
      .min(now_ms.saturating_add(bundle.refresh_interval_secs.saturating_mul(1000))),
    None => now_ms,
  }
}

fn log_outcome(id: BundleId, outcome: &Outcome) {
  match outcome {
    Outcome::Refreshed { .. } | Outcome::Failed(_) => {}
    other => tracing::debug!(bundle_id = id, outcome = ?other, "scheduled refresh ended without a commit"),
  }
}

/// Clears the in-flight mark for a bundle when the worker ends, however it
/// ends.
struct InFlightGuard {
  set: Arc<Mutex<HashSet<BundleId>>>,
  id: BundleId,
}

impl InFlightGuard {
  fn mark(set: Arc<Mutex<HashSet<BundleId>>>, id: BundleId) -> Self {
    set
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id);
    Self { set, id }
  }
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self
      .set
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.id);
  }
}
