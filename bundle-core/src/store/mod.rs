use crate::error::{BundleError, BundleRef};
use crate::types::{BundleId, BundleRefreshError, NewTrustBundle, TrustBundle, TrustBundleAnchor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod file;

pub use file::FileBundleStore;

/// Durable record of bundles, their anchor sets and refresh state.
///
/// Implementations serialize writes per bundle and must apply
/// `replace_anchors` as one unit: anchors, version, last error and
/// timestamps become visible together or not at all.
pub trait BundleStore: Send + Sync {
  fn list_bundles(&self) -> Result<Vec<TrustBundle>, BundleError>;

  fn get_bundle(&self, id: BundleId) -> Result<TrustBundle, BundleError>;

  fn get_bundle_by_name(&self, name: &str) -> Result<TrustBundle, BundleError>;

  fn add_bundle(&self, bundle: NewTrustBundle) -> Result<BundleId, BundleError>;

  /// Returns how many of `ids` existed and were removed.
  fn delete_bundles(&self, ids: &[BundleId]) -> Result<usize, BundleError>;

  /// Installs a complete anchor set if the stored version still equals
  /// `expected_version` and the bundle is enabled. On success the version is
  /// incremented, the outcome becomes `SUCCESS` and the committed record is
  /// returned.
  fn replace_anchors(
    &self,
    id: BundleId,
    expected_version: u64,
    as_of: u64,
    anchors: Vec<TrustBundleAnchor>,
    checksum: String,
  ) -> Result<TrustBundle, BundleError>;

  /// Records the code of a failed attempt. Refused with `Disabled` once the
  /// bundle is disabled, like `replace_anchors`.
  fn record_refresh_outcome(
    &self,
    id: BundleId,
    as_of: u64,
    outcome: BundleRefreshError,
  ) -> Result<(), BundleError>;

  fn update_signing_certificate(
    &self,
    id: BundleId,
    certificate: Option<Vec<u8>>,
  ) -> Result<(), BundleError>;

  fn set_enabled(&self, id: BundleId, enabled: bool) -> Result<(), BundleError>;

  /// Changes how often the bundle is refreshed. The scheduler picks the new
  /// interval up on its next tick.
  fn set_refresh_interval(&self, id: BundleId, interval_secs: u64) -> Result<(), BundleError>;
}

/// The state both store implementations operate on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct BundleTable {
  #[serde(default)]
  next_id: BundleId,
  #[serde(default)]
  bundles: BTreeMap<BundleId, TrustBundle>,
}

impl BundleTable {
  pub(crate) fn list(&self) -> Vec<TrustBundle> {
    self.bundles.values().cloned().collect()
  }

  pub(crate) fn get(&self, id: BundleId) -> Result<&TrustBundle, BundleError> {
    self.bundles.get(&id).ok_or_else(|| BundleError::not_found(id))
  }

  fn get_mut(&mut self, id: BundleId) -> Result<&mut TrustBundle, BundleError> {
    self.bundles.get_mut(&id).ok_or_else(|| BundleError::not_found(id))
  }

  pub(crate) fn get_by_name(&self, name: &str) -> Result<&TrustBundle, BundleError> {
    self
      .bundles
      .values()
      .find(|b| b.name == name)
      .ok_or_else(|| BundleError::NotFound(BundleRef::Name(name.to_string())))
  }

  pub(crate) fn add(&mut self, new: NewTrustBundle) -> Result<BundleId, BundleError> {
    if self.bundles.values().any(|b| b.name == new.name) {
      return Err(BundleError::DuplicateName(new.name));
    }

    let id = self.next_id.max(self.bundles.keys().next_back().copied().unwrap_or(0)) + 1;
    self.next_id = id;
    self.bundles.insert(
      id,
      TrustBundle {
        id,
        name: new.name,
        source_url: new.source_url,
        refresh_interval_secs: new.refresh_interval_secs,
        enabled: new.enabled,
        signing_certificate: new.signing_certificate,
        last_success_at: None,
        last_attempt_at: None,
        last_error: None,
        version: 0,
        checksum: None,
        anchors: Vec::new(),
      },
    );
    Ok(id)
  }

  pub(crate) fn delete(&mut self, ids: &[BundleId]) -> usize {
    ids
      .iter()
      .filter(|id| self.bundles.remove(*id).is_some())
      .count()
  }

  pub(crate) fn replace_anchors(
    &mut self,
    id: BundleId,
    expected_version: u64,
    as_of: u64,
    anchors: Vec<TrustBundleAnchor>,
    checksum: String,
  ) -> Result<TrustBundle, BundleError> {
    let bundle = self.get_mut(id)?;
    if !bundle.enabled {
      return Err(BundleError::Disabled(id));
    }
    if bundle.version != expected_version {
      return Err(BundleError::VersionConflict {
        id,
        expected: expected_version,
        current: bundle.version,
      });
    }

    bundle.anchors = anchors
      .into_iter()
      .map(|mut a| {
        a.bundle_id = id;
        a
      })
      .collect();
    bundle.version += 1;
    bundle.checksum = Some(checksum);
    bundle.last_error = Some(BundleRefreshError::Success);
    bundle.last_attempt_at = Some(as_of);
    bundle.last_success_at = Some(as_of);
    Ok(bundle.clone())
  }

  pub(crate) fn record_outcome(
    &mut self,
    id: BundleId,
    as_of: u64,
    outcome: BundleRefreshError,
  ) -> Result<(), BundleError> {
    let bundle = self.get_mut(id)?;
    if !bundle.enabled {
      return Err(BundleError::Disabled(id));
    }
    bundle.last_attempt_at = Some(as_of);
    bundle.last_error = Some(outcome);
    if outcome == BundleRefreshError::Success {
      bundle.last_success_at = Some(as_of);
    }
    Ok(())
  }

  pub(crate) fn set_signing_certificate(
    &mut self,
    id: BundleId,
    certificate: Option<Vec<u8>>,
  ) -> Result<(), BundleError> {
    self.get_mut(id)?.signing_certificate = certificate;
    Ok(())
  }

  pub(crate) fn set_enabled(&mut self, id: BundleId, enabled: bool) -> Result<(), BundleError> {
    self.get_mut(id)?.enabled = enabled;
    Ok(())
  }

  pub(crate) fn set_refresh_interval(
    &mut self,
    id: BundleId,
    interval_secs: u64,
  ) -> Result<(), BundleError> {
    if interval_secs == 0 {
      return Err(BundleError::InvalidBundle(
        "refresh interval must be positive".to_string(),
      ));
    }
    self.get_mut(id)?.refresh_interval_secs = interval_secs;
    Ok(())
  }
}

/// Process-local store. Readers clone whole records under the read lock.
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
  table: RwLock<BundleTable>,
}

impl MemoryBundleStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, BundleTable>, BundleError> {
    self
      .table
      .read()
      .map_err(|_| anyhow::anyhow!("bundle store lock poisoned").into())
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, BundleTable>, BundleError> {
    self
      .table
      .write()
      .map_err(|_| anyhow::anyhow!("bundle store lock poisoned").into())
  }
}

impl BundleStore for MemoryBundleStore {
  fn list_bundles(&self) -> Result<Vec<TrustBundle>, BundleError> {
    Ok(self.read()?.list())
  }

  fn get_bundle(&self, id: BundleId) -> Result<TrustBundle, BundleError> {
    self.read()?.get(id).cloned()
  }

  fn get_bundle_by_name(&self, name: &str) -> Result<TrustBundle, BundleError> {
    self.read()?.get_by_name(name).cloned()
  }

  fn add_bundle(&self, bundle: NewTrustBundle) -> Result<BundleId, BundleError> {
    self.write()?.add(bundle)
  }

  fn delete_bundles(&self, ids: &[BundleId]) -> Result<usize, BundleError> {
    Ok(self.write()?.delete(ids))
  }

  fn replace_anchors(
    &self,
    id: BundleId,
    expected_version: u64,
    as_of: u64,
    anchors: Vec<TrustBundleAnchor>,
    checksum: String,
  ) -> Result<TrustBundle, BundleError> {
    self
      .write()?
      .replace_anchors(id, expected_version, as_of, anchors, checksum)
  }

  fn record_refresh_outcome(
    &self,
    id: BundleId,
    as_of: u64,
    outcome: BundleRefreshError,
  ) -> Result<(), BundleError> {
    self.write()?.record_outcome(id, as_of, outcome)
  }

  fn update_signing_certificate(
    &self,
    id: BundleId,
    certificate: Option<Vec<u8>>,
  ) -> Result<(), BundleError> {
    self.write()?.set_signing_certificate(id, certificate)
  }

  fn set_enabled(&self, id: BundleId, enabled: bool) -> Result<(), BundleError> {
    self.write()?.set_enabled(id, enabled)
  }

  fn set_refresh_interval(&self, id: BundleId, interval_secs: u64) -> Result<(), BundleError> {
    self.write()?.set_refresh_interval(id, interval_secs)
  }
}
