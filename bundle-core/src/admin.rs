//! Administrative operations on bundle records.
//!
//! These never trigger a refresh. A changed signing certificate is first used
//! by the next scheduled or manual refresh.

use crate::config::Config;
use crate::error::BundleError;
use crate::refresh::fetch::validate_source_url;
use crate::refresh::parse::{is_certificate_label, pem_blocks};
use crate::store::BundleStore;
use crate::types::{BundleId, NewTrustBundle};
use anyhow::Context;
use std::fs;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

pub fn add_bundle(store: &dyn BundleStore, bundle: NewTrustBundle) -> Result<BundleId, BundleError> {
  if bundle.name.trim().is_empty() {
    return Err(BundleError::InvalidBundle("name must not be empty".to_string()));
  }
  if bundle.refresh_interval_secs == 0 {
    return Err(BundleError::InvalidBundle(
      "refresh interval must be > 0".to_string(),
    ));
  }
  validate_source_url(&bundle.source_url)
    .map_err(|e| BundleError::InvalidBundle(format!("{e:#}")))?;
  if let Some(cert) = bundle.signing_certificate.as_deref() {
    certificate_der(cert)?;
  }

  let name = bundle.name.clone();
  let id = store.add_bundle(bundle)?;
  tracing::info!(bundle_id = id, name = %name, "trust bundle added");
  Ok(id)
}

/// Deletes every listed bundle. A refresh already in flight for one of them
/// finishes but its result is discarded.
pub fn delete_bundles(store: &dyn BundleStore, ids: &[BundleId]) -> Result<usize, BundleError> {
  let removed = store.delete_bundles(ids)?;
  tracing::info!(requested = ids.len(), removed, "trust bundles deleted");
  Ok(removed)
}

pub fn set_enabled(store: &dyn BundleStore, id: BundleId, enabled: bool) -> Result<(), BundleError> {
  store.set_enabled(id, enabled)?;
  tracing::info!(bundle_id = id, enabled, "trust bundle policy updated");
  Ok(())
}

/// Takes effect on the next scheduler tick, counted from the start of the
/// interval already running.
pub fn set_refresh_interval(
  store: &dyn BundleStore,
  id: BundleId,
  interval_secs: u64,
) -> Result<(), BundleError> {
  if interval_secs == 0 {
    return Err(BundleError::InvalidBundle(
      "refresh interval must be > 0".to_string(),
    ));
  }
  store.set_refresh_interval(id, interval_secs)?;
  tracing::info!(bundle_id = id, interval_secs, "refresh interval updated");
  Ok(())
}

/// Replaces the signing certificate of a bundle with the certificate found in
/// `credential`. On `BadCredential` the existing certificate stays in place.
pub fn update_signing_certificate(
  store: &dyn BundleStore,
  id: BundleId,
  credential: &[u8],
) -> Result<(), BundleError> {
  let der = extract_certificate(credential)?;
  store.update_signing_certificate(id, Some(der))?;
  tracing::info!(bundle_id = id, "signing certificate updated");
  Ok(())
}

pub fn clear_signing_certificate(store: &dyn BundleStore, id: BundleId) -> Result<(), BundleError> {
  store.update_signing_certificate(id, None)?;
  tracing::info!(bundle_id = id, "signing certificate cleared; payloads no longer verified");
  Ok(())
}

/// Pulls the public certificate out of a credential container.
///
/// PEM input yields its first certificate block (key blocks are ignored).
/// Binary input is either exactly one DER certificate or a PKCS#12 store
/// with an empty password, which yields its first X.509 certificate.
pub fn extract_certificate(credential: &[u8]) -> Result<Vec<u8>, BundleError> {
  if let Ok(text) = std::str::from_utf8(credential) {
    if text.contains("-----BEGIN ") {
      return pem_certificate(text);
    }
  }
  match certificate_der(credential) {
    Ok(der) => Ok(der.to_vec()),
    Err(not_der) => match p12::PFX::parse(credential) {
      Ok(pfx) => pkcs12_certificate(&pfx),
      Err(_) => Err(not_der),
    },
  }
}

fn pkcs12_certificate(pfx: &p12::PFX) -> Result<Vec<u8>, BundleError> {
  let certs = pfx
    .cert_x509_bags("")
    .map_err(|e| BundleError::BadCredential(format!("unreadable PKCS#12 store: {e:?}")))?;
  let first = certs
    .into_iter()
    .next()
    .ok_or_else(|| BundleError::BadCredential("PKCS#12 store holds no certificate".to_string()))?;
  certificate_der(&first)?;
  Ok(first)
}

fn pem_certificate(text: &str) -> Result<Vec<u8>, BundleError> {
  let mut last_problem = "no CERTIFICATE block".to_string();
  for block in pem_blocks(text) {
    let parsed = match pem::parse(block) {
      Ok(p) => p,
      Err(e) => {
        last_problem = format!("unreadable PEM block: {e}");
        continue;
      }
    };
    if !is_certificate_label(parsed.tag()) {
      continue;
    }
    match certificate_der(parsed.contents()) {
      Ok(der) => return Ok(der.to_vec()),
      Err(BundleError::BadCredential(reason)) => last_problem = reason,
      Err(e) => return Err(e),
    }
  }
  Err(BundleError::BadCredential(last_problem))
}

fn certificate_der(der: &[u8]) -> Result<&[u8], BundleError> {
  let (rest, _) = X509Certificate::from_der(der)
    .map_err(|e| BundleError::BadCredential(format!("no usable certificate: {e}")))?;
  if !rest.is_empty() {
    return Err(BundleError::BadCredential(format!(
      "{} unexpected bytes after certificate",
      rest.len()
    )));
  }
  Ok(der)
}

/// Adds every configured bundle that the store does not know by name yet.
/// Existing records are left alone; the store is the source of truth once a
/// bundle exists.
pub fn sync_from_config(store: &dyn BundleStore, cfg: &Config) -> anyhow::Result<usize> {
  let mut added = 0usize;

  for entry in &cfg.bundles {
    match store.get_bundle_by_name(&entry.name) {
      Ok(_) => continue,
      Err(BundleError::NotFound(_)) => {}
      Err(e) => return Err(e).context("look up configured bundle"),
    }

    let mut bundle = NewTrustBundle::new(
      entry.name.clone(),
      entry.url.clone(),
      entry.interval_secs(&cfg.refresh),
    );
    if !entry.enabled {
      bundle = bundle.disabled();
    }
    if let Some(path) = &entry.signing_certificate {
      let raw = fs::read(path)
        .with_context(|| format!("read signing certificate {}", path.display()))?;
      let der = extract_certificate(&raw)
        .with_context(|| format!("signing certificate {}", path.display()))?;
      bundle = bundle.with_signing_certificate(der);
    }

    add_bundle(store, bundle).with_context(|| format!("add configured bundle {:?}", entry.name))?;
    added += 1;
  }

  Ok(added)
}
