use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

pub type BundleId = u64;

/// Result code recorded for every refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleRefreshError {
  Success,
  FetchFailure,
  SignatureFailure,
  ParseFailure,
  UnknownFailure,
}

impl BundleRefreshError {
  pub fn as_str(&self) -> &'static str {
    match self {
      BundleRefreshError::Success => "SUCCESS",
      BundleRefreshError::FetchFailure => "FETCH_FAILURE",
      BundleRefreshError::SignatureFailure => "SIGNATURE_FAILURE",
      BundleRefreshError::ParseFailure => "PARSE_FAILURE",
      BundleRefreshError::UnknownFailure => "UNKNOWN_FAILURE",
    }
  }
}

impl fmt::Display for BundleRefreshError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One trust anchor. Anchors are owned by exactly one installed anchor set
/// and are never edited after installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundleAnchor {
  pub bundle_id: BundleId,
  #[serde(with = "der_base64")]
  pub der: Vec<u8>,
  pub thumbprint: String,
  pub subject: String,
  pub valid_from: i64,
  pub valid_to: i64,
  #[serde(default)]
  pub is_ca: bool,
}

/// A bundle record together with its installed anchor set.
///
/// The anchor set lives inside the record so that a reader always receives
/// anchors, version and refresh state from the same committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
  pub id: BundleId,
  pub name: String,
  pub source_url: String,
  pub refresh_interval_secs: u64,
  pub enabled: bool,

  #[serde(default, with = "opt_der_base64")]
  pub signing_certificate: Option<Vec<u8>>,

  #[serde(default)]
  pub last_success_at: Option<u64>,
  #[serde(default)]
  pub last_attempt_at: Option<u64>,
  #[serde(default)]
  pub last_error: Option<BundleRefreshError>,
  #[serde(default)]
  pub version: u64,
  #[serde(default)]
  pub checksum: Option<String>,
  #[serde(default)]
  pub anchors: Vec<TrustBundleAnchor>,
}

impl TrustBundle {
  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs)
  }

  pub fn anchor_count(&self) -> usize {
    self.anchors.len()
  }
}

/// Administrative input for creating a bundle; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrustBundle {
  pub name: String,
  pub source_url: String,
  pub refresh_interval_secs: u64,
  pub enabled: bool,
  pub signing_certificate: Option<Vec<u8>>,
}

impl NewTrustBundle {
  pub fn new(name: impl Into<String>, source_url: impl Into<String>, refresh_interval_secs: u64) -> Self {
    Self {
      name: name.into(),
      source_url: source_url.into(),
      refresh_interval_secs,
      enabled: true,
      signing_certificate: None,
    }
  }

  pub fn with_signing_certificate(mut self, der: Vec<u8>) -> Self {
    self.signing_certificate = Some(der);
    self
  }

  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

pub fn now_unix_ms() -> u64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

pub fn now_unix_s() -> u64 {
  now_unix_ms() / 1000
}

mod der_base64 {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(d)?;
    STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
  }
}

mod opt_der_base64 {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
      Some(b) => s.serialize_some(&STANDARD.encode(b)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let text = Option::<String>::deserialize(d)?;
    text
      .map(|t| STANDARD.decode(t.as_bytes()).map_err(serde::de::Error::custom))
      .transpose()
  }
}
