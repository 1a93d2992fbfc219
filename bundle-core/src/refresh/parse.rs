use super::envelope::{self, Element};
use crate::types::{sha256_hex, BundleId, TrustBundleAnchor};
use std::collections::HashSet;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::ber::Tag;
use x509_parser::prelude::FromDer;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("payload is not a certificate collection: {0}")]
  Malformed(String),

  #[error("payload contained no usable anchors ({skipped} entries skipped)")]
  NoAnchors { skipped: usize },
}

/// A certificate accepted as an anchor, before it is attached to a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorCertificate {
  pub der: Vec<u8>,
  pub thumbprint: String,
  pub subject: String,
  pub valid_from: i64,
  pub valid_to: i64,
  pub is_ca: bool,
}

impl AnchorCertificate {
  pub fn into_anchor(self, bundle_id: BundleId) -> TrustBundleAnchor {
    TrustBundleAnchor {
      bundle_id,
      der: self.der,
      thumbprint: self.thumbprint,
      subject: self.subject,
      valid_from: self.valid_from,
      valid_to: self.valid_to,
      is_ca: self.is_ca,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
  pub index: usize,
  pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedAnchors {
  pub anchors: Vec<AnchorCertificate>,
  pub skipped: Vec<SkippedEntry>,
}

pub trait PayloadParser: Send + Sync {
  fn parse(&self, payload: &[u8], now_unix_s: u64) -> Result<ParsedAnchors, ParseError>;
}

/// Decodes PEM, concatenated DER or PKCS#7 certs-only payloads into a
/// de-duplicated anchor set.
#[derive(Debug, Clone, Copy)]
pub struct AnchorParser {
  skip_expired: bool,
}

impl Default for AnchorParser {
  fn default() -> Self {
    Self { skip_expired: true }
  }
}

impl AnchorParser {
  pub fn new(skip_expired: bool) -> Self {
    Self { skip_expired }
  }

  pub fn parse_at(&self, payload: &[u8], now_unix_s: u64) -> Result<ParsedAnchors, ParseError> {
    let entries = split_entries(payload)?;
    let now = i64::try_from(now_unix_s).unwrap_or(i64::MAX);

    let mut out = ParsedAnchors::default();
    let mut seen = HashSet::new();

    for (index, entry) in entries.into_iter().enumerate() {
      let der = match entry {
        RawEntry::Der(der) => der,
        RawEntry::Skip(reason) => {
          out.skipped.push(SkippedEntry { index, reason });
          continue;
        }
      };

      let anchor = match inspect_certificate(&der) {
        Ok(a) => a,
        Err(reason) => {
          out.skipped.push(SkippedEntry { index, reason });
          continue;
        }
      };

      if self.skip_expired && (now < anchor.valid_from || now > anchor.valid_to) {
        out.skipped.push(SkippedEntry {
          index,
          reason: format!("certificate {} outside its validity window", anchor.subject),
        });
        continue;
      }

      if seen.insert(anchor.thumbprint.clone()) {
        out.anchors.push(anchor);
      }
    }

    if out.anchors.is_empty() {
      return Err(ParseError::NoAnchors {
        skipped: out.skipped.len(),
      });
    }
    Ok(out)
  }
}

impl PayloadParser for AnchorParser {
  fn parse(&self, payload: &[u8], now_unix_s: u64) -> Result<ParsedAnchors, ParseError> {
    self.parse_at(payload, now_unix_s)
  }
}

enum RawEntry {
  Der(Vec<u8>),
  Skip(String),
}

fn split_entries(payload: &[u8]) -> Result<Vec<RawEntry>, ParseError> {
  if payload.iter().all(|b| b.is_ascii_whitespace()) {
    return Err(ParseError::Malformed("empty payload".to_string()));
  }

  if let Ok(text) = std::str::from_utf8(payload) {
    if text.contains("-----BEGIN ") {
      return Ok(pem_entries(text));
    }
  }

  if let Some(signed) = envelope::signed_data(payload) {
    if signed.is_signed() {
      return Err(ParseError::Malformed(
        "signed envelope must be opened before its anchors are read".to_string(),
      ));
    }
    return Ok(
      signed
        .certificates
        .into_iter()
        .enumerate()
        .map(|(i, raw)| match Element::read(raw) {
          Some((el, _)) if el.universal(Tag::Sequence) => RawEntry::Der(raw.to_vec()),
          _ => RawEntry::Skip(format!("collection entry {i} is not a certificate")),
        })
        .collect(),
    );
  }

  der_entries(payload)
}

fn pem_entries(text: &str) -> Vec<RawEntry> {
  pem_blocks(text)
    .into_iter()
    .map(|block| match pem::parse(block) {
      Ok(p) if is_certificate_label(p.tag()) => RawEntry::Der(p.contents().to_vec()),
      Ok(p) => RawEntry::Skip(format!("PEM block {:?} is not a certificate", p.tag())),
      Err(e) => RawEntry::Skip(format!("unreadable PEM block: {e}")),
    })
    .collect()
}

pub(crate) fn is_certificate_label(label: &str) -> bool {
  matches!(label, "CERTIFICATE" | "X509 CERTIFICATE" | "TRUSTED CERTIFICATE")
}

/// Splits PEM text into `-----BEGIN ...-----` .. `-----END ...-----` blocks so
/// that one damaged block does not hide the others.
pub(crate) fn pem_blocks(text: &str) -> Vec<&str> {
  let mut out = Vec::new();
  let mut rest = text;

  while let Some(start) = rest.find("-----BEGIN ") {
    let block = &rest[start..];
    let Some(end) = block.find("-----END ") else {
      out.push(block);
      break;
    };
    let after_end = end + "-----END ".len();
    let stop = block[after_end..]
      .find("-----")
      .map(|i| after_end + i + "-----".len())
      .unwrap_or(block.len());
    out.push(&block[..stop]);
    rest = &block[stop..];
  }

  out
}

fn der_entries(bytes: &[u8]) -> Result<Vec<RawEntry>, ParseError> {
  let mut out = Vec::new();
  let mut rest = bytes;

  while !rest.is_empty() {
    let Some((element, tail)) = Element::read(rest) else {
      if out.is_empty() {
        return Err(ParseError::Malformed("not PEM and not DER".to_string()));
      }
      out.push(RawEntry::Skip(format!("{} trailing bytes without DER framing", rest.len())));
      break;
    };

    let is_sequence = element.universal(Tag::Sequence);
    if out.is_empty() && !is_sequence {
      return Err(ParseError::Malformed(format!(
        "leading DER element has tag {:?}, expected a SEQUENCE",
        element.header.tag()
      )));
    }

    if is_sequence {
      out.push(RawEntry::Der(element.raw.to_vec()));
    } else {
      out.push(RawEntry::Skip(format!(
        "DER element with tag {:?} is not a certificate",
        element.header.tag()
      )));
    }
    rest = tail;
  }

  Ok(out)
}

fn inspect_certificate(der: &[u8]) -> Result<AnchorCertificate, String> {
  let (rest, cert) =
    X509Certificate::from_der(der).map_err(|e| format!("not an X.509 certificate: {e}"))?;
  let der = &der[..der.len() - rest.len()];

  Ok(AnchorCertificate {
    der: der.to_vec(),
    thumbprint: sha256_hex(der),
    subject: cert.subject().to_string(),
    valid_from: cert.validity().not_before.timestamp(),
    valid_to: cert.validity().not_after.timestamp(),
    is_ca: cert.is_ca(),
  })
}
