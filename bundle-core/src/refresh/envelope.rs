//! CMS / PKCS#7 SignedData framing.
//!
//! Bundles published as `.p7b` or `.p7m` arrive either DER encoded or BER
//! encoded with indefinite lengths, so everything here reads BER.

use x509_parser::der_parser::ber::{parse_ber_any, Class, Header, Length, Tag};

// DER content octets of the object identifiers we look for.
const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
const OID_MESSAGE_DIGEST: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x04];

/// One BER element: its header, content octets and the full encoding.
#[derive(Debug, Clone)]
pub(crate) struct Element<'a> {
  pub header: Header<'a>,
  pub content: &'a [u8],
  pub raw: &'a [u8],
}

impl<'a> Element<'a> {
  /// Reads the element at the start of `bytes` and returns it with the rest.
  pub fn read(bytes: &'a [u8]) -> Option<(Self, &'a [u8])> {
    let (rest, any) = parse_ber_any(bytes).ok()?;
    let raw = &bytes[..bytes.len() - rest.len()];
    Some((
      Self {
        header: any.header,
        content: any.data,
        raw,
      },
      rest,
    ))
  }

  pub fn universal(&self, tag: Tag) -> bool {
    self.header.class() == Class::Universal && self.header.tag() == tag
  }

  pub fn context(&self, number: u32) -> bool {
    self.header.class() == Class::ContextSpecific && self.header.tag().0 == number
  }

  pub fn children(&self) -> Option<Vec<Element<'a>>> {
    read_all(self.content)
  }
}

pub(crate) fn read_all(mut bytes: &[u8]) -> Option<Vec<Element<'_>>> {
  let mut out = Vec::new();
  while !bytes.is_empty() {
    let (element, rest) = Element::read(bytes)?;
    out.push(element);
    bytes = rest;
  }
  Some(out)
}

/// A parsed SignedData. `signers` is empty for a certs-only collection.
#[derive(Debug, Clone)]
pub struct SignedData<'a> {
  /// Encapsulated content, absent for a detached signature.
  pub content: Option<Vec<u8>>,
  /// Raw encodings of the entries of the `certificates` field.
  pub certificates: Vec<&'a [u8]>,
  pub signers: Vec<SignerInfo>,
}

impl SignedData<'_> {
  pub fn is_signed(&self) -> bool {
    !self.signers.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerInfo {
  /// Content octets of the digest algorithm OID.
  pub digest_algorithm: Vec<u8>,
  /// DER `SET OF Attribute`, the bytes the signature covers when present.
  pub signed_attributes: Option<Vec<u8>>,
  pub message_digest: Option<Vec<u8>>,
  pub signature: Vec<u8>,
}

/// Returns the SignedData carried by `payload`, or `None` if the payload is
/// not a ContentInfo of type signedData.
pub fn signed_data(payload: &[u8]) -> Option<SignedData<'_>> {
  let (content_info, _) = Element::read(payload)?;
  if !content_info.universal(Tag::Sequence) {
    return None;
  }
  let fields = content_info.children()?;
  let [oid, explicit, ..] = fields.as_slice() else {
    return None;
  };
  if !oid.universal(Tag::Oid) || oid.content != OID_SIGNED_DATA || !explicit.context(0) {
    return None;
  }

  let (body, _) = Element::read(explicit.content)?;
  if !body.universal(Tag::Sequence) {
    return None;
  }

  // version, digestAlgorithms, encapContentInfo, [0] certificates,
  // [1] crls, signerInfos
  let mut fields = body.children()?.into_iter();
  let _version = fields.next()?;
  let _digest_algorithms = fields.next()?;
  let content = encapsulated_content(&fields.next()?)?;

  let mut certificates = Vec::new();
  let mut signers = Vec::new();
  for field in fields {
    if field.context(0) {
      certificates = field.children()?.into_iter().map(|c| c.raw).collect();
    } else if field.universal(Tag::Set) {
      signers = field
        .children()?
        .iter()
        .map(signer_info)
        .collect::<Option<Vec<_>>>()?;
    }
  }

  Some(SignedData {
    content,
    certificates,
    signers,
  })
}

fn encapsulated_content(encap: &Element<'_>) -> Option<Option<Vec<u8>>> {
  if !encap.universal(Tag::Sequence) {
    return None;
  }
  let fields = encap.children()?;
  match fields.as_slice() {
    [content_type] if content_type.universal(Tag::Oid) => Some(None),
    [content_type, explicit, ..] if content_type.universal(Tag::Oid) && explicit.context(0) => {
      let (inner, _) = Element::read(explicit.content)?;
      octets(&inner).map(Some)
    }
    _ => None,
  }
}

/// Content of an OCTET STRING, joining the segments of a constructed one.
fn octets(element: &Element<'_>) -> Option<Vec<u8>> {
  if !element.universal(Tag::OctetString) {
    return None;
  }
  if !element.header.is_constructed() {
    return Some(element.content.to_vec());
  }
  let mut out = Vec::new();
  for segment in element.children()? {
    out.extend(octets(&segment)?);
  }
  Some(out)
}

fn signer_info(element: &Element<'_>) -> Option<SignerInfo> {
  let mut fields = element.children()?.into_iter();
  let _version = fields.next()?;
  let _sid = fields.next()?;
  let digest_algorithm = fields.next()?.children()?.first()?.content.to_vec();

  let mut next = fields.next()?;
  let mut signed_attributes = None;
  let mut message_digest = None;
  if next.context(0) {
    signed_attributes = Some(attributes_as_set(&next));
    message_digest = find_message_digest(&next);
    next = fields.next()?;
  }

  let _signature_algorithm = next;
  let signature = octets(&fields.next()?)?;

  Some(SignerInfo {
    digest_algorithm,
    signed_attributes,
    message_digest,
    signature,
  })
}

/// Re-encodes `[0] IMPLICIT SignedAttributes` with the universal SET tag and
/// a definite length, which is what the signature covers.
fn attributes_as_set(attrs: &Element<'_>) -> Vec<u8> {
  if attrs.header.length() != Length::Indefinite && attrs.raw.first() == Some(&0xa0) {
    let mut der = attrs.raw.to_vec();
    der[0] = 0x31;
    return der;
  }
  let mut der = vec![0x31];
  push_length(&mut der, attrs.content.len());
  der.extend_from_slice(attrs.content);
  der
}

fn find_message_digest(attrs: &Element<'_>) -> Option<Vec<u8>> {
  attrs.children()?.iter().find_map(|attr| {
    let parts = attr.children()?;
    let [oid, values, ..] = parts.as_slice() else {
      return None;
    };
    if oid.content != OID_MESSAGE_DIGEST {
      return None;
    }
    octets(values.children()?.first()?)
  })
}

fn push_length(out: &mut Vec<u8>, len: usize) {
  if len < 0x80 {
    out.push(len as u8);
    return;
  }
  let bytes: Vec<u8> = len
    .to_be_bytes()
    .into_iter()
    .skip_while(|b| *b == 0)
    .collect();
  out.push(0x80 | bytes.len() as u8);
  out.extend_from_slice(&bytes);
}
