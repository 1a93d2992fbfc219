use crate::refresh::fetch::validate_source_url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct Config {
  pub logging: LoggingConfig,
  pub refresh: RefreshConfig,
  pub bundles: Vec<BundleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
  /// How often the scheduler looks for due bundles.
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,

  /// Used for configured bundles that do not set their own interval.
  #[serde(default = "default_interval_minutes")]
  pub default_interval_minutes: u64,

  #[serde(default = "default_fetch_timeout_seconds")]
  pub fetch_timeout_seconds: u64,

  #[serde(default = "default_max_payload_bytes")]
  pub max_payload_bytes: usize,

  #[serde(default = "default_max_signature_bytes")]
  pub max_signature_bytes: usize,

  #[serde(default = "default_true")]
  pub skip_expired_anchors: bool,

  #[serde(default = "default_commit_retries")]
  pub commit_retries: u32,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: default_poll_interval_ms(),
      default_interval_minutes: default_interval_minutes(),
      fetch_timeout_seconds: default_fetch_timeout_seconds(),
      max_payload_bytes: default_max_payload_bytes(),
      max_signature_bytes: default_max_signature_bytes(),
      skip_expired_anchors: true,
      commit_retries: default_commit_retries(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
  pub name: String,
  pub url: String,

  #[serde(default)]
  pub refresh_interval_minutes: Option<u64>,

  #[serde(default = "default_true")]
  pub enabled: bool,

  /// PEM or DER credential holding the certificate that signs this bundle.
  #[serde(default)]
  pub signing_certificate: Option<PathBuf>,
}

impl BundleConfig {
  pub fn interval_secs(&self, refresh: &RefreshConfig) -> u64 {
    self
      .refresh_interval_minutes
      .unwrap_or(refresh.default_interval_minutes)
      .saturating_mul(60)
  }
}

fn default_true() -> bool {
  true
}

fn default_poll_interval_ms() -> u64 {
  1_000
}

fn default_interval_minutes() -> u64 {
  60
}

fn default_fetch_timeout_seconds() -> u64 {
  30
}

fn default_max_payload_bytes() -> usize {
  8 * 1024 * 1024
}

fn default_max_signature_bytes() -> usize {
  16 * 1024
}

fn default_commit_retries() -> u32 {
  3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub refresh: Option<RefreshConfig>,

  #[serde(default)]
  pub bundles: Vec<BundleConfig>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let mut cfg = Config::default();
    if let Some(l) = self.logging {
      cfg.logging = l;
    }
    if let Some(r) = self.refresh {
      cfg.refresh = r;
    }

    if let Some(reason) = validate_refresh_config(&cfg.refresh) {
      tracing::warn!(reason = %reason, "refresh config invalid; using defaults");
      cfg.refresh = RefreshConfig::default();
    }

    let mut names = HashSet::new();
    for bundle in self.bundles {
      if let Some(reason) = validate_bundle_config(&bundle) {
        tracing::warn!(name = %bundle.name, reason = %reason, "bundle entry ignored");
        continue;
      }
      if !names.insert(bundle.name.clone()) {
        tracing::warn!(name = %bundle.name, "duplicate bundle entry ignored");
        continue;
      }
      cfg.bundles.push(bundle);
    }

    cfg
  }

  fn needs_upgrade(&self) -> bool {
    self.logging.is_none() || self.refresh.is_none()
  }
}

pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, true)
}

pub fn load_or_default_readonly(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, false)
}

fn load_impl(path: &Path, allow_writes: bool) -> anyhow::Result<Config> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  if allow_writes {
    fs::create_dir_all(parent)?;
  }

  if !path.exists() {
    let cfg = Config::default();
    if allow_writes {
      write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
    } else {
      eprintln!(
        "trust-bundles: config missing at {}; using defaults (read-only).",
        path.display()
      );
    }
    return Ok(cfg);
  }

  let raw = fs::read_to_string(path)?;
  match toml::from_str::<ConfigFile>(&raw) {
    Ok(file) => {
      let upgrade = file.needs_upgrade();
      let cfg = file.normalize();
      if allow_writes && upgrade {
        let backup = parent.join(format!("config.toml.bak-{}", unix_now_s()));
        let _ = fs::copy(path, &backup);
        let _ = write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?);
        eprintln!(
          "trust-bundles: upgraded config defaults written to {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(cfg)
    }
    Err(e) => {
      let cfg = Config::default();
      if allow_writes {
        let backup = parent.join(format!("config.toml.bad-{}", unix_now_s()));
        let _ = fs::rename(path, &backup);
        write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
        eprintln!(
          "trust-bundles: invalid config at {} (backed up to {}): {e}",
          path.display(),
          backup.display()
        );
      } else {
        eprintln!(
          "trust-bundles: invalid config at {}; using defaults (read-only): {e}",
          path.display()
        );
      }
      Ok(cfg)
    }
  }
}

fn to_config_file(cfg: &Config) -> ConfigFile {
  ConfigFile {
    logging: Some(cfg.logging.clone()),
    refresh: Some(cfg.refresh.clone()),
    bundles: cfg.bundles.clone(),
  }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  let tmp = parent.join(format!(
    ".{}.tmp",
    path.file_name().unwrap_or_default().to_string_lossy()
  ));

  fs::write(&tmp, contents)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

fn unix_now_s() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

pub fn validate_refresh_config(cfg: &RefreshConfig) -> Option<String> {
  if cfg.poll_interval_ms == 0 {
    return Some("poll_interval_ms must be > 0".to_string());
  }
  if cfg.default_interval_minutes == 0 {
    return Some("default_interval_minutes must be > 0".to_string());
  }
  if cfg.fetch_timeout_seconds == 0 {
    return Some("fetch_timeout_seconds must be > 0".to_string());
  }
  if cfg.max_payload_bytes == 0 {
    return Some("max_payload_bytes must be > 0".to_string());
  }
  if cfg.max_signature_bytes == 0 {
    return Some("max_signature_bytes must be > 0".to_string());
  }
  None
}

fn validate_bundle_config(bundle: &BundleConfig) -> Option<String> {
  if bundle.name.trim().is_empty() {
    return Some("name must not be empty".to_string());
  }
  if bundle.refresh_interval_minutes == Some(0) {
    return Some("refresh_interval_minutes must be > 0".to_string());
  }
  if let Err(e) = validate_source_url(&bundle.url) {
    return Some(e.to_string());
  }
  None
}
