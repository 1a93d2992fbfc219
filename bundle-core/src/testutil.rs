//! Certificates, signers and fakes shared by the unit tests.

use crate::notify::NotificationSink;
use crate::refresh::fetch::{FetchedPayload, PayloadFetcher};
use crate::refresh::parse::AnchorParser;
use crate::types::{BundleId, TrustBundle, TrustBundleAnchor};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
  Current,
  Expired,
  Future,
}

impl Validity {
  fn years(self) -> (i32, i32) {
    match self {
      Validity::Current => (2020, 2080),
      Validity::Expired => (2000, 2001),
      Validity::Future => (2085, 2090),
    }
  }
}

fn certificate(cn: &str, validity: Validity, ca: bool, key: &KeyPair) -> rcgen::Certificate {
  let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
  params.distinguished_name.push(DnType::CommonName, cn);
  let (from, to) = validity.years();
  params.not_before = rcgen::date_time_ymd(from, 1, 1);
  params.not_after = rcgen::date_time_ymd(to, 1, 1);
  if ca {
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  }
  params.self_signed(key).unwrap()
}

#[derive(Debug, Clone)]
pub struct TestCert {
  pub der: Vec<u8>,
  pub pem: String,
}

impl TestCert {
  pub fn into_anchor(self, bundle_id: BundleId) -> TrustBundleAnchor {
    let mut parsed = AnchorParser::new(false).parse_at(&self.der, 0).unwrap();
    parsed.anchors.remove(0).into_anchor(bundle_id)
  }
}

fn build_cert(cn: &str, validity: Validity) -> TestCert {
  let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
  let cert = certificate(cn, validity, true, &key);
  TestCert {
    der: cert.der().to_vec(),
    pem: cert.pem(),
  }
}

/// Self-signed CA certificate valid for several decades around today.
pub fn anchor_cert(cn: &str) -> TestCert {
  build_cert(cn, Validity::Current)
}

pub fn expired_anchor_cert(cn: &str) -> TestCert {
  build_cert(cn, Validity::Expired)
}

pub fn pem_payload(certs: &[TestCert]) -> Vec<u8> {
  certs
    .iter()
    .map(|c| c.pem.as_str())
    .collect::<Vec<_>>()
    .join("\n")
    .into_bytes()
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
  let mut out = vec![tag];
  let len = content.len();
  if len < 0x80 {
    out.push(len as u8);
  } else {
    let bytes: Vec<u8> = len
      .to_be_bytes()
      .into_iter()
      .skip_while(|b| *b == 0)
      .collect();
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
  }
  out.extend_from_slice(content);
  out
}

const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
const OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
const OID_CONTENT_TYPE: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x03];
const OID_MESSAGE_DIGEST: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x04];
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

fn ber_indefinite(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
  let mut out = vec![tag, 0x80];
  for part in parts {
    out.extend_from_slice(part);
  }
  out.extend_from_slice(&[0x00, 0x00]);
  out
}

fn content_info(signed_data: &[u8]) -> Vec<u8> {
  let mut content_info = der_tlv(0x06, OID_SIGNED_DATA);
  content_info.extend(der_tlv(0xa0, &der_tlv(0x30, signed_data)));
  der_tlv(0x30, &content_info)
}

/// Certs-only PKCS#7 SignedData carrying `certs`.
pub fn pkcs7_payload(certs: &[TestCert]) -> Vec<u8> {
  let cert_bytes: Vec<u8> = certs.iter().flat_map(|c| c.der.iter().copied()).collect();

  let mut signed_data = Vec::new();
  signed_data.extend(der_tlv(0x02, &[0x01]));
  signed_data.extend(der_tlv(0x31, &[]));
  signed_data.extend(der_tlv(0x30, &der_tlv(0x06, OID_DATA)));
  signed_data.extend(der_tlv(0xa0, &cert_bytes));
  signed_data.extend(der_tlv(0x31, &[]));
  content_info(&signed_data)
}

/// The same collection with every constructed wrapper BER indefinite-length
/// encoded.
pub fn pkcs7_payload_indefinite(certs: &[TestCert]) -> Vec<u8> {
  let cert_bytes: Vec<u8> = certs.iter().flat_map(|c| c.der.iter().copied()).collect();

  let signed_data = ber_indefinite(
    0x30,
    &[
      der_tlv(0x02, &[0x01]),
      der_tlv(0x31, &[]),
      ber_indefinite(0x30, &[der_tlv(0x06, OID_DATA)]),
      ber_indefinite(0xa0, &[cert_bytes]),
      der_tlv(0x31, &[]),
    ],
  );
  ber_indefinite(
    0x30,
    &[der_tlv(0x06, OID_SIGNED_DATA), ber_indefinite(0xa0, &[signed_data])],
  )
}

/// CMS SignedData that encapsulates `content`, signed by `signer`, with the
/// signer's certificate in the `certificates` field.
pub fn signed_envelope(signer: &TestSigner, content: &[u8], signed_attributes: bool) -> Vec<u8> {
  signed_envelope_over(signer, content, content, signed_attributes)
}

/// Like `signed_envelope`, but the signature covers `signed` while the
/// envelope carries `carried`.
pub fn signed_envelope_over(
  signer: &TestSigner,
  signed: &[u8],
  carried: &[u8],
  signed_attributes: bool,
) -> Vec<u8> {
  let digest_algorithm = der_tlv(0x30, &der_tlv(0x06, OID_SHA256));

  let mut signer_info = der_tlv(0x02, &[0x01]);
  signer_info.extend(der_tlv(
    0x30,
    &[der_tlv(0x30, &[]), der_tlv(0x02, &[0x01])].concat(),
  ));
  signer_info.extend_from_slice(&digest_algorithm);
  let signature = if signed_attributes {
    let attributes = [
      der_tlv(
        0x30,
        &[der_tlv(0x06, OID_CONTENT_TYPE), der_tlv(0x31, &der_tlv(0x06, OID_DATA))].concat(),
      ),
      der_tlv(
        0x30,
        &[
          der_tlv(0x06, OID_MESSAGE_DIGEST),
          der_tlv(0x31, &der_tlv(0x04, &Sha256::digest(signed))),
        ]
        .concat(),
      ),
    ]
    .concat();
    signer_info.extend(der_tlv(0xa0, &attributes));
    signer.sign(&der_tlv(0x31, &attributes))
  } else {
    signer.sign(signed)
  };
  signer_info.extend(der_tlv(0x30, &der_tlv(0x06, signer.signature_oid())));
  signer_info.extend(der_tlv(0x04, &signature));

  let mut signed_data = der_tlv(0x02, &[0x01]);
  signed_data.extend(der_tlv(0x31, &digest_algorithm));
  signed_data.extend(der_tlv(
    0x30,
    &[der_tlv(0x06, OID_DATA), der_tlv(0xa0, &der_tlv(0x04, carried))].concat(),
  ));
  signed_data.extend(der_tlv(0xa0, &signer.cert_der));
  signed_data.extend(der_tlv(0x31, &der_tlv(0x30, &signer_info)));
  content_info(&signed_data)
}

enum SignerKey {
  Ed25519(ed25519_dalek::SigningKey),
  P256(p256::ecdsa::SigningKey),
}

pub struct TestSigner {
  pub cert_der: Vec<u8>,
  pub cert_pem: String,
  /// PKCS#8 DER of the private key.
  pub key_der: Vec<u8>,
  key: SignerKey,
}

impl TestSigner {
  fn signature_oid(&self) -> &'static [u8] {
    match self.key {
      SignerKey::Ed25519(_) => &[0x2b, 0x65, 0x70],
      SignerKey::P256(_) => &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02],
    }
  }

  /// PKCS#12 with an empty password holding the certificate and its key.
  pub fn pkcs12(&self) -> Vec<u8> {
    p12::PFX::new(&self.cert_der, &self.key_der, None, "", "bundle signer")
      .unwrap()
      .to_der()
  }

  /// Ed25519 signatures are always 64 bytes; ECDSA ones are DER encoded.
  pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
    match &self.key {
      SignerKey::Ed25519(key) => {
        use ed25519_dalek::Signer;
        key.sign(payload).to_bytes().to_vec()
      }
      SignerKey::P256(key) => {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = key.sign(payload);
        sig.to_der().as_bytes().to_vec()
      }
    }
  }

  /// Fixed-width `r || s` form.
  pub fn sign_fixed(&self, payload: &[u8]) -> Vec<u8> {
    match &self.key {
      SignerKey::Ed25519(_) => self.sign(payload),
      SignerKey::P256(key) => {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = key.sign(payload);
        sig.to_bytes().to_vec()
      }
    }
  }
}

pub fn ed25519_signer(validity: Validity) -> TestSigner {
  use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
  use ed25519_dalek::pkcs8::EncodePrivateKey;

  let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
  let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
  let key_pair = KeyPair::from_pem(&pem).unwrap();
  let cert = certificate("bundle signer", validity, false, &key_pair);

  TestSigner {
    cert_der: cert.der().to_vec(),
    cert_pem: cert.pem(),
    key_der: key_pair.serialize_der(),
    key: SignerKey::Ed25519(key),
  }
}

pub fn p256_signer() -> TestSigner {
  use p256::pkcs8::DecodePrivateKey;

  let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
  let key = p256::ecdsa::SigningKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap();
  let cert = certificate("bundle signer", Validity::Current, false, &key_pair);

  TestSigner {
    cert_der: cert.der().to_vec(),
    cert_pem: cert.pem(),
    key_der: key_pair.serialize_der(),
    key: SignerKey::P256(key),
  }
}

/// Sink that keeps every notification it receives.
#[derive(Default)]
pub struct RecordingSink {
  events: Mutex<Vec<TrustBundle>>,
}

impl RecordingSink {
  pub fn events(&self) -> Vec<TrustBundle> {
    self.events.lock().unwrap().clone()
  }
}

impl NotificationSink for RecordingSink {
  fn notify_bundle_refreshed(&self, bundle: &TrustBundle) {
    self.events.lock().unwrap().push(bundle.clone());
  }
}

/// Returns a fixed payload, or a fixed error once `fail_with` is called.
pub struct StaticFetcher {
  result: Mutex<Result<FetchedPayload, String>>,
  calls: AtomicUsize,
}

impl StaticFetcher {
  pub fn ok(payload: FetchedPayload) -> Self {
    Self {
      result: Mutex::new(Ok(payload)),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn fail_with(&self, reason: &str) {
    *self.result.lock().unwrap() = Err(reason.to_string());
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl PayloadFetcher for StaticFetcher {
  fn fetch(&self, _bundle: &TrustBundle) -> anyhow::Result<FetchedPayload> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self
      .result
      .lock()
      .unwrap()
      .clone()
      .map_err(|reason| anyhow::anyhow!(reason))
  }
}

/// Fetcher that announces each call and blocks until the test releases it.
pub struct GatedFetcher {
  payload: FetchedPayload,
  entered: Mutex<mpsc::Sender<()>>,
  release: Mutex<mpsc::Receiver<()>>,
}

pub struct Gate {
  entered: mpsc::Receiver<()>,
  release: mpsc::Sender<()>,
}

impl GatedFetcher {
  pub fn new(payload: FetchedPayload) -> (Self, Gate) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
      Self {
        payload,
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
      },
      Gate {
        entered: entered_rx,
        release: release_tx,
      },
    )
  }
}

impl PayloadFetcher for GatedFetcher {
  fn fetch(&self, _bundle: &TrustBundle) -> anyhow::Result<FetchedPayload> {
    let _ = self.entered.lock().unwrap().send(());
    self
      .release
      .lock()
      .unwrap()
      .recv_timeout(Duration::from_secs(10))
      .map_err(|_| anyhow::anyhow!("gate never released"))?;
    Ok(self.payload.clone())
  }
}

impl Gate {
  pub fn wait_entered(&self) {
    self
      .entered
      .recv_timeout(Duration::from_secs(10))
      .expect("fetcher was never entered");
  }

  pub fn entered_within(&self, wait: Duration) -> bool {
    self.entered.recv_timeout(wait).is_ok()
  }

  pub fn release(&self) {
    self.release.send(()).unwrap();
  }
}
