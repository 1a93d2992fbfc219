use super::{BundleStore, BundleTable};
use crate::error::BundleError;
use crate::types::{BundleId, BundleRefreshError, NewTrustBundle, TrustBundle, TrustBundleAnchor};
use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

/// Bundle store persisted as a JSON snapshot.
///
/// Every write applies to a copy of the table, persists the copy, and only
/// then publishes it. A failed persist leaves the in-memory state untouched.
///
/// Several processes may share one snapshot (the service and console
/// commands). Writers hold an exclusive lock on a sidecar `.lock` file and
/// re-read the snapshot before applying their change; readers reload it
/// whenever the file on disk differs from the one last seen.
#[derive(Debug)]
pub struct FileBundleStore {
  path: PathBuf,
  lock_path: PathBuf,
  state: RwLock<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
  modified: SystemTime,
  len: u64,
  // Each atomic write renames a fresh file into place.
  inode: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
  table: BundleTable,
  stamp: Option<FileStamp>,
}

impl Snapshot {
  fn load(path: &Path) -> anyhow::Result<Self> {
    let mut file = match File::open(path) {
      Ok(f) => f,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let stamp = stamp_of(&file.metadata().with_context(|| format!("stat {}", path.display()))?);

    let mut bytes = Vec::new();
    file
      .read_to_end(&mut bytes)
      .with_context(|| format!("read {}", path.display()))?;
    let table = serde_json::from_slice::<BundleTable>(&bytes)
      .with_context(|| format!("parse bundle store {}", path.display()))?;

    Ok(Self {
      table,
      stamp: Some(stamp),
    })
  }
}

impl FileBundleStore {
  pub fn open(path: &Path) -> anyhow::Result<Self> {
    let snapshot = Snapshot::load(path)?;
    Ok(Self {
      path: path.to_path_buf(),
      lock_path: lock_path(path),
      state: RwLock::new(snapshot),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn read<T>(&self, f: impl FnOnce(&BundleTable) -> Result<T, BundleError>) -> Result<T, BundleError> {
    let on_disk = current_stamp(&self.path)?;
    {
      let guard = self
        .state
        .read()
        .map_err(|_| anyhow::anyhow!("bundle store lock poisoned"))?;
      if guard.stamp == on_disk {
        return f(&guard.table);
      }
    }

    let mut guard = self
      .state
      .write()
      .map_err(|_| anyhow::anyhow!("bundle store lock poisoned"))?;
    if guard.stamp != on_disk {
      tracing::debug!(path = %self.path.display(), "bundle store changed on disk; reloading");
      *guard = Snapshot::load(&self.path)?;
    }
    f(&guard.table)
  }

  fn mutate<T>(
    &self,
    f: impl FnOnce(&mut BundleTable) -> Result<T, BundleError>,
  ) -> Result<T, BundleError> {
    let mut guard = self
      .state
      .write()
      .map_err(|_| anyhow::anyhow!("bundle store lock poisoned"))?;
    let _lock = self.lock_exclusive()?;

    let latest = Snapshot::load(&self.path)?;
    let mut next = latest.table.clone();
    let out = f(&mut next);
    *guard = latest;
    let out = out?;

    persist(&self.path, &next)?;
    guard.table = next;
    guard.stamp = current_stamp(&self.path)?;
    Ok(out)
  }

  /// Held until the returned file is dropped.
  fn lock_exclusive(&self) -> anyhow::Result<File> {
    if let Some(dir) = self.lock_path.parent() {
      fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&self.lock_path)
      .with_context(|| format!("open {}", self.lock_path.display()))?;
    FileExt::lock_exclusive(&file).with_context(|| format!("lock {}", self.lock_path.display()))?;
    Ok(file)
  }
}

impl BundleStore for FileBundleStore {
  fn list_bundles(&self) -> Result<Vec<TrustBundle>, BundleError> {
    self.read(|t| Ok(t.list()))
  }

  fn get_bundle(&self, id: BundleId) -> Result<TrustBundle, BundleError> {
    self.read(|t| t.get(id).cloned())
  }

  fn get_bundle_by_name(&self, name: &str) -> Result<TrustBundle, BundleError> {
    self.read(|t| t.get_by_name(name).cloned())
  }

  fn add_bundle(&self, bundle: NewTrustBundle) -> Result<BundleId, BundleError> {
    self.mutate(|t| t.add(bundle))
  }

  fn delete_bundles(&self, ids: &[BundleId]) -> Result<usize, BundleError> {
    self.mutate(|t| Ok(t.delete(ids)))
  }

  fn replace_anchors(
    &self,
    id: BundleId,
    expected_version: u64,
    as_of: u64,
    anchors: Vec<TrustBundleAnchor>,
    checksum: String,
  ) -> Result<TrustBundle, BundleError> {
    self.mutate(|t| t.replace_anchors(id, expected_version, as_of, anchors, checksum))
  }

  fn record_refresh_outcome(
    &self,
    id: BundleId,
    as_of: u64,
    outcome: BundleRefreshError,
  ) -> Result<(), BundleError> {
    self.mutate(|t| t.record_outcome(id, as_of, outcome))
  }

  fn update_signing_certificate(
    &self,
    id: BundleId,
    certificate: Option<Vec<u8>>,
  ) -> Result<(), BundleError> {
    self.mutate(|t| t.set_signing_certificate(id, certificate))
  }

  fn set_enabled(&self, id: BundleId, enabled: bool) -> Result<(), BundleError> {
    self.mutate(|t| t.set_enabled(id, enabled))
  }

  fn set_refresh_interval(&self, id: BundleId, interval_secs: u64) -> Result<(), BundleError> {
    self.mutate(|t| t.set_refresh_interval(id, interval_secs))
  }
}

fn stamp_of(meta: &fs::Metadata) -> FileStamp {
  #[cfg(unix)]
  let inode = std::os::unix::fs::MetadataExt::ino(meta);
  #[cfg(not(unix))]
  let inode = 0;
  FileStamp {
    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    len: meta.len(),
    inode,
  }
}

fn current_stamp(path: &Path) -> anyhow::Result<Option<FileStamp>> {
  match fs::metadata(path) {
    Ok(meta) => Ok(Some(stamp_of(&meta))),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
  }
}

fn lock_path(dst: &Path) -> PathBuf {
  let name = dst.file_name().and_then(|s| s.to_str()).unwrap_or("store");
  dst.with_file_name(format!(".{name}.lock"))
}

fn persist(path: &Path, table: &BundleTable) -> anyhow::Result<()> {
  let bytes = serde_json::to_vec_pretty(table).context("serialize bundle store")?;
  atomic_write_file(path, &bytes)
}

fn atomic_write_file(dst: &Path, bytes: &[u8]) -> anyhow::Result<()> {
  let dir = dst
    .parent()
    .ok_or_else(|| anyhow::anyhow!("destination has no parent directory"))?;
  fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

  let tmp = tmp_path(dst);
  fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
  fs::rename(&tmp, dst).with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
  Ok(())
}

fn tmp_path(dst: &Path) -> PathBuf {
  let name = dst.file_name().and_then(|s| s.to_str()).unwrap_or("tmp");
  dst.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.json");

    let store = FileBundleStore::open(&path).unwrap();
    let id = store
      .add_bundle(NewTrustBundle::new("direct", "https://example.org/d.pem", 300))
      .unwrap();
    store
      .record_refresh_outcome(id, 42, BundleRefreshError::FetchFailure)
      .unwrap();
    drop(store);

    let reopened = FileBundleStore::open(&path).unwrap();
    let b = reopened.get_bundle_by_name("direct").unwrap();
    assert_eq!(b.id, id);
    assert_eq!(b.last_error, Some(BundleRefreshError::FetchFailure));
    assert_eq!(b.last_attempt_at, Some(42));

    let next = reopened
      .add_bundle(NewTrustBundle::new("other", "https://example.org/o.pem", 300))
      .unwrap();
    assert!(next > id);
  }

  #[test]
  fn rejected_write_does_not_touch_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.json");
    let store = FileBundleStore::open(&path).unwrap();
    store
      .add_bundle(NewTrustBundle::new("direct", "https://example.org/d.pem", 300))
      .unwrap();
    let before = fs::read(&path).unwrap();

    let err = store
      .replace_anchors(1, 5, 1, Vec::new(), "x".to_string())
      .unwrap_err();
    assert!(matches!(err, BundleError::VersionConflict { .. }));
    assert_eq!(fs::read(&path).unwrap(), before);
  }

  #[test]
  fn changes_from_another_instance_are_seen_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.json");

    let service = FileBundleStore::open(&path).unwrap();
    let kept = service
      .add_bundle(NewTrustBundle::new("kept", "https://example.org/k.pem", 300))
      .unwrap();
    let gone = service
      .add_bundle(NewTrustBundle::new("gone", "https://example.org/g.pem", 300))
      .unwrap();
    assert_eq!(service.list_bundles().unwrap().len(), 2);

    let console = FileBundleStore::open(&path).unwrap();
    console.delete_bundles(&[gone]).unwrap();
    console
      .update_signing_certificate(kept, Some(vec![0x30, 0x00]))
      .unwrap();

    assert!(service.get_bundle(gone).unwrap_err().is_not_found());
    assert!(service
      .replace_anchors(gone, 0, 10, Vec::new(), "x".to_string())
      .unwrap_err()
      .is_not_found());
    assert_eq!(
      service.get_bundle(kept).unwrap().signing_certificate,
      Some(vec![0x30, 0x00])
    );

    service
      .record_refresh_outcome(kept, 20, BundleRefreshError::FetchFailure)
      .unwrap();
    let reopened = FileBundleStore::open(&path).unwrap();
    let names: Vec<_> = reopened.list_bundles().unwrap().into_iter().map(|b| b.name).collect();
    assert_eq!(names, vec!["kept".to_string()]);
    let b = reopened.get_bundle(kept).unwrap();
    assert_eq!(b.signing_certificate, Some(vec![0x30, 0x00]));
    assert_eq!(b.last_error, Some(BundleRefreshError::FetchFailure));
  }

  #[test]
  fn disable_from_another_instance_stops_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.json");
    let service = FileBundleStore::open(&path).unwrap();
    let id = service
      .add_bundle(NewTrustBundle::new("direct", "https://example.org/d.pem", 300))
      .unwrap();
    assert!(service.get_bundle(id).unwrap().enabled);

    FileBundleStore::open(&path).unwrap().set_enabled(id, false).unwrap();

    assert!(!service.get_bundle(id).unwrap().enabled);
    let err = service
      .replace_anchors(id, 0, 10, Vec::new(), "x".to_string())
      .unwrap_err();
    assert!(matches!(err, BundleError::Disabled(_)));
    assert!(!FileBundleStore::open(&path).unwrap().get_bundle(id).unwrap().enabled);
  }

  #[test]
  fn unreadable_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundles.json");
    fs::write(&path, b"{not json").unwrap();
    assert!(FileBundleStore::open(&path).is_err());
  }
}
