use crate::config::RefreshConfig;
use crate::types::TrustBundle;
use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPayload {
  pub content: Vec<u8>,
  pub signature: Option<Vec<u8>>,
}

impl FetchedPayload {
  pub fn unsigned(content: Vec<u8>) -> Self {
    Self {
      content,
      signature: None,
    }
  }

  pub fn signed(content: Vec<u8>, signature: Vec<u8>) -> Self {
    Self {
      content,
      signature: Some(signature),
    }
  }
}

/// Retrieves the raw payload (and detached signature, if any) of a bundle.
pub trait PayloadFetcher: Send + Sync {
  fn fetch(&self, bundle: &TrustBundle) -> anyhow::Result<FetchedPayload>;
}

/// Fetches `https`/`http` sources over a blocking client and `file` sources
/// from disk. The detached signature lives next to the payload at `<url>.sig`.
pub struct SourceFetcher {
  client: Client,
  max_payload_bytes: usize,
  max_signature_bytes: usize,
}

impl SourceFetcher {
  pub fn new(cfg: &RefreshConfig) -> anyhow::Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(cfg.fetch_timeout_seconds))
      .redirect(Policy::none())
      .build()
      .context("build HTTP client")?;

    Ok(Self {
      client,
      max_payload_bytes: cfg.max_payload_bytes,
      max_signature_bytes: cfg.max_signature_bytes,
    })
  }
}

impl PayloadFetcher for SourceFetcher {
  fn fetch(&self, bundle: &TrustBundle) -> anyhow::Result<FetchedPayload> {
    let url = validate_source_url(&bundle.source_url)?;
    let wants_signature = bundle.signing_certificate.is_some();

    if url.scheme() == "file" {
      let path = url
        .to_file_path()
        .map_err(|_| anyhow::anyhow!("file URL has no usable path: {url}"))?;
      let content = read_file_with_limit(&path, self.max_payload_bytes)?;
      let sig_path = signature_path(&path);
      let signature = if wants_signature && sig_path.exists() {
        Some(read_file_with_limit(&sig_path, self.max_signature_bytes)?)
      } else {
        None
      };
      return Ok(FetchedPayload { content, signature });
    }

    let content = http_get_bytes(&self.client, &url, self.max_payload_bytes)?
      .ok_or_else(|| anyhow::anyhow!("bundle source not found: {}", safe_url_label(&url)))?;
    let signature = if wants_signature {
      http_get_bytes(&self.client, &signature_url(&url), self.max_signature_bytes)?
    } else {
      None
    };

    Ok(FetchedPayload { content, signature })
  }
}

pub fn validate_source_url(raw: &str) -> anyhow::Result<Url> {
  let url = Url::parse(raw.trim()).with_context(|| format!("invalid source URL: {raw}"))?;
  match url.scheme() {
    "https" | "http" => {
      if url.host_str().is_none() {
        anyhow::bail!("source URL has no host: {raw}");
      }
    }
    "file" => {}
    other => anyhow::bail!("unsupported source URL scheme {other:?}"),
  }
  Ok(url)
}

fn signature_url(url: &Url) -> Url {
  let mut sig = url.clone();
  sig.set_path(&format!("{}.sig", url.path()));
  sig
}

fn signature_path(path: &Path) -> PathBuf {
  let mut raw = path.as_os_str().to_os_string();
  raw.push(".sig");
  PathBuf::from(raw)
}

/// `Ok(None)` means the server answered 404.
fn http_get_bytes(client: &Client, url: &Url, max_bytes: usize) -> anyhow::Result<Option<Vec<u8>>> {
  let response = client
    .get(url.clone())
    .header(
      USER_AGENT,
      format!("trust-bundles/{}", env!("CARGO_PKG_VERSION")),
    )
    .send()
    .with_context(|| format!("GET {}", safe_url_label(url)))?;

  match response.status() {
    StatusCode::OK => read_response_with_limit(response, max_bytes).map(Some),
    StatusCode::NOT_FOUND => Ok(None),
    status => anyhow::bail!(
      "unexpected HTTP status {} for {}",
      status.as_u16(),
      safe_url_label(url)
    ),
  }
}

fn read_response_with_limit(response: Response, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  read_with_limit(response, max_bytes).context("read response body")
}

fn read_file_with_limit(path: &Path, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
  read_with_limit(file, max_bytes).with_context(|| format!("read {}", path.display()))
}

fn read_with_limit(reader: impl Read, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut limited = reader.take((max_bytes.saturating_add(1)) as u64);
  limited.read_to_end(&mut out)?;

  if out.len() > max_bytes {
    anyhow::bail!("payload exceeds max size {} bytes", max_bytes);
  }
  Ok(out)
}

fn safe_url_label(url: &Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  format!("{host}{path}")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bundle_for(url: &str, signed: bool) -> TrustBundle {
    TrustBundle {
      id: 1,
      name: "local".to_string(),
      source_url: url.to_string(),
      refresh_interval_secs: 60,
      enabled: true,
      signing_certificate: signed.then(|| vec![0x30]),
      last_success_at: None,
      last_attempt_at: None,
      last_error: None,
      version: 0,
      checksum: None,
      anchors: Vec::new(),
    }
  }

  fn fetcher(max_payload_bytes: usize) -> SourceFetcher {
    let cfg = RefreshConfig {
      max_payload_bytes,
      ..RefreshConfig::default()
    };
    SourceFetcher::new(&cfg).unwrap()
  }

  fn file_url(path: &Path) -> String {
    Url::from_file_path(path).unwrap().to_string()
  }

  #[test]
  fn file_source_reads_payload_and_detached_signature() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("bundle.pem");
    fs::write(&payload, b"payload").unwrap();
    fs::write(dir.path().join("bundle.pem.sig"), b"sig").unwrap();

    let got = fetcher(1024).fetch(&bundle_for(&file_url(&payload), true)).unwrap();
    assert_eq!(got, FetchedPayload::signed(b"payload".to_vec(), b"sig".to_vec()));

    let unsigned = fetcher(1024).fetch(&bundle_for(&file_url(&payload), false)).unwrap();
    assert_eq!(unsigned.signature, None);
  }

  #[test]
  fn file_source_without_signature_file_is_unsigned() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("bundle.pem");
    fs::write(&payload, b"payload").unwrap();

    let got = fetcher(1024).fetch(&bundle_for(&file_url(&payload), true)).unwrap();
    assert_eq!(got.signature, None);
  }

  #[test]
  fn oversized_payload_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("bundle.pem");
    fs::write(&payload, vec![b'x'; 64]).unwrap();

    let err = fetcher(16)
      .fetch(&bundle_for(&file_url(&payload), false))
      .unwrap_err();
    assert!(format!("{err:#}").contains("max size"));
  }

  #[test]
  fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let url = file_url(&dir.path().join("absent.pem"));
    assert!(fetcher(1024).fetch(&bundle_for(&url, false)).is_err());
  }

  #[test]
  fn source_url_validation() {
    assert!(validate_source_url("https://bundles.example.org/direct.p7b").is_ok());
    assert!(validate_source_url("file:///etc/bundles/direct.pem").is_ok());
    assert!(validate_source_url("ftp://bundles.example.org/direct.p7b").is_err());
    assert!(validate_source_url("not a url").is_err());
  }

  #[test]
  fn signature_url_appends_suffix() {
    let url = Url::parse("https://bundles.example.org/feeds/direct.p7b?x=1").unwrap();
    let sig = signature_url(&url);
    assert_eq!(sig.path(), "/feeds/direct.p7b.sig");
    assert_eq!(sig.query(), Some("x=1"));
  }
}
