use super::envelope::{SignedData, SignerInfo};
use crate::types::now_unix_s;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256, Sha512};
use x509_parser::prelude::*;

const OID_ED25519: &str = "1.3.101.112";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

// DER content octets of 2.16.840.1.101.3.4.2.1 and .3.
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_SHA512: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03];

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
  #[error("payload carries no signature")]
  MissingSignature,

  #[error("signing certificate is not valid X.509: {0}")]
  BadCertificate(String),

  #[error("signing certificate not valid at {now} (valid {not_before}..{not_after})")]
  CertificateNotValid {
    now: i64,
    not_before: i64,
    not_after: i64,
  },

  #[error("unsupported signing key: {0}")]
  UnsupportedKey(String),

  #[error("malformed signature: {0}")]
  MalformedSignature(String),

  #[error("unsupported digest algorithm")]
  UnsupportedDigest,

  #[error("signature does not match payload")]
  Mismatch,
}

/// Confirms that a payload was produced by the holder of a signing
/// certificate. Implementations must not touch bundle state.
pub trait PayloadVerifier: Send + Sync {
  fn verify(
    &self,
    payload: &[u8],
    signature: Option<&[u8]>,
    signing_certificate: &[u8],
  ) -> Result<(), VerificationError>;

  /// Verifies a CMS SignedData whose signature travels with the content.
  fn verify_envelope(
    &self,
    envelope: &SignedData<'_>,
    signing_certificate: &[u8],
  ) -> Result<(), VerificationError>;
}

/// Verifies Ed25519 or ECDSA P-256 signatures, detached or inside a CMS
/// envelope, against the public key of a DER certificate, checked against the
/// wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateVerifier;

impl PayloadVerifier for CertificateVerifier {
  fn verify(
    &self,
    payload: &[u8],
    signature: Option<&[u8]>,
    signing_certificate: &[u8],
  ) -> Result<(), VerificationError> {
    verify_at(payload, signature, signing_certificate, now_unix_s())
  }

  fn verify_envelope(
    &self,
    envelope: &SignedData<'_>,
    signing_certificate: &[u8],
  ) -> Result<(), VerificationError> {
    verify_envelope_at(envelope, signing_certificate, now_unix_s())
  }
}

pub fn verify_at(
  payload: &[u8],
  signature: Option<&[u8]>,
  signing_certificate: &[u8],
  now_unix_s: u64,
) -> Result<(), VerificationError> {
  let signature = signature.ok_or(VerificationError::MissingSignature)?;
  let cert = valid_certificate(signing_certificate, now_unix_s)?;
  verify_with_key(&cert, payload, &decode_signature(signature))
}

/// Accepts the envelope if any of its signers verifies against the signing
/// certificate. With signed attributes the signature covers the attributes,
/// whose message digest must match the encapsulated content.
pub fn verify_envelope_at(
  envelope: &SignedData<'_>,
  signing_certificate: &[u8],
  now_unix_s: u64,
) -> Result<(), VerificationError> {
  if !envelope.is_signed() {
    return Err(VerificationError::MissingSignature);
  }
  let cert = valid_certificate(signing_certificate, now_unix_s)?;
  let content = envelope.content.as_deref().ok_or_else(|| {
    VerificationError::MalformedSignature("envelope carries no content".to_string())
  })?;

  let mut last = VerificationError::MissingSignature;
  for signer in &envelope.signers {
    match verify_signer(&cert, signer, content) {
      Ok(()) => return Ok(()),
      Err(e) => last = e,
    }
  }
  Err(last)
}

fn verify_signer(
  cert: &X509Certificate<'_>,
  signer: &SignerInfo,
  content: &[u8],
) -> Result<(), VerificationError> {
  let Some(attributes) = signer.signed_attributes.as_deref() else {
    return verify_with_key(cert, content, &signer.signature);
  };

  let expected = signer.message_digest.as_deref().ok_or_else(|| {
    VerificationError::MalformedSignature("signed attributes lack a message digest".to_string())
  })?;
  if digest(&signer.digest_algorithm, content)? != expected {
    return Err(VerificationError::Mismatch);
  }
  verify_with_key(cert, attributes, &signer.signature)
}

fn digest(algorithm: &[u8], content: &[u8]) -> Result<Vec<u8>, VerificationError> {
  if algorithm == OID_SHA256 {
    Ok(Sha256::digest(content).to_vec())
  } else if algorithm == OID_SHA512 {
    Ok(Sha512::digest(content).to_vec())
  } else {
    Err(VerificationError::UnsupportedDigest)
  }
}

fn valid_certificate(der: &[u8], now_unix_s: u64) -> Result<X509Certificate<'_>, VerificationError> {
  let (_, cert) =
    X509Certificate::from_der(der).map_err(|e| VerificationError::BadCertificate(e.to_string()))?;

  let now = i64::try_from(now_unix_s).unwrap_or(i64::MAX);
  let not_before = cert.validity().not_before.timestamp();
  let not_after = cert.validity().not_after.timestamp();
  if now < not_before || now > not_after {
    return Err(VerificationError::CertificateNotValid {
      now,
      not_before,
      not_after,
    });
  }
  Ok(cert)
}

fn verify_with_key(
  cert: &X509Certificate<'_>,
  message: &[u8],
  sig: &[u8],
) -> Result<(), VerificationError> {
  let spki = cert.public_key();
  let key: &[u8] = spki.subject_public_key.data.as_ref();

  match spki.algorithm.algorithm.to_id_string().as_str() {
    OID_ED25519 => verify_ed25519(message, sig, key),
    OID_EC_PUBLIC_KEY => verify_p256(message, sig, key),
    other => Err(VerificationError::UnsupportedKey(format!("algorithm {other}"))),
  }
}

/// Accepts raw signature bytes or base64 text in any common alphabet.
pub fn decode_signature(raw: &[u8]) -> Vec<u8> {
  let Ok(text) = std::str::from_utf8(raw) else {
    return raw.to_vec();
  };
  let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
  if compact.is_empty() || !compact.bytes().all(is_base64_byte) {
    return raw.to_vec();
  }

  for engine in [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD] {
    if let Ok(decoded) = engine.decode(compact.as_bytes()) {
      return decoded;
    }
  }
  raw.to_vec()
}

fn is_base64_byte(b: u8) -> bool {
  b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'=')
}

fn verify_ed25519(payload: &[u8], sig: &[u8], key: &[u8]) -> Result<(), VerificationError> {
  use ed25519_dalek::{Signature, VerifyingKey};

  let key: [u8; 32] = key
    .try_into()
    .map_err(|_| VerificationError::UnsupportedKey("Ed25519 key must be 32 bytes".to_string()))?;
  let key = VerifyingKey::from_bytes(&key)
    .map_err(|e| VerificationError::UnsupportedKey(format!("Ed25519 key: {e}")))?;

  let sig: [u8; 64] = sig.try_into().map_err(|_| {
    VerificationError::MalformedSignature(format!(
      "Ed25519 signature must be 64 bytes, got {}",
      sig.len()
    ))
  })?;

  key
    .verify_strict(payload, &Signature::from_bytes(&sig))
    .map_err(|_| VerificationError::Mismatch)
}

fn verify_p256(payload: &[u8], sig: &[u8], key: &[u8]) -> Result<(), VerificationError> {
  use p256::ecdsa::signature::Verifier;
  use p256::ecdsa::{Signature, VerifyingKey};

  let key = VerifyingKey::from_sec1_bytes(key)
    .map_err(|_| VerificationError::UnsupportedKey("EC key is not a P-256 point".to_string()))?;

  let sig = if sig.len() == 64 {
    Signature::from_slice(sig)
  } else {
    Signature::from_der(sig)
  }
  .map_err(|e| VerificationError::MalformedSignature(format!("ECDSA signature: {e}")))?;

  key
    .verify(payload, &sig)
    .map_err(|_| VerificationError::Mismatch)
}
