use crate::types::BundleId;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleRef {
  Id(BundleId),
  Name(String),
}

impl fmt::Display for BundleRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BundleRef::Id(id) => write!(f, "#{id}"),
      BundleRef::Name(name) => write!(f, "{name:?}"),
    }
  }
}

/// Errors surfaced by the bundle store and the administrative path.
///
/// Refresh pipeline failures are not represented here; they are recorded as
/// [`crate::types::BundleRefreshError`] on the bundle itself.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
  #[error("trust bundle {0} not found")]
  NotFound(BundleRef),

  #[error("a trust bundle named {0:?} already exists")]
  DuplicateName(String),

  #[error("bad credential: {0}")]
  BadCredential(String),

  #[error("invalid trust bundle: {0}")]
  InvalidBundle(String),

  #[error("trust bundle #{id} changed concurrently (expected version {expected}, found {current})")]
  VersionConflict {
    id: BundleId,
    expected: u64,
    current: u64,
  },

  #[error("trust bundle #{0} is disabled")]
  Disabled(BundleId),

  #[error(transparent)]
  Backend(#[from] anyhow::Error),
}

impl BundleError {
  pub fn not_found(id: BundleId) -> Self {
    BundleError::NotFound(BundleRef::Id(id))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, BundleError::NotFound(_))
  }
}
