//! EFI signature lists
//!
//! Format of every trust database the firmware keeps (PK, KEK, db, the MOK
//! lists) and of the pending requests we hand to shim:
//!
//! ```text
//! [SignatureType: 16 bytes GUID]
//! [SignatureListSize: 4 bytes]
//! [SignatureHeaderSize: 4 bytes]
//! [SignatureSize: 4 bytes]
//! [SignatureHeader: SignatureHeaderSize bytes]
//! [Signatures: SignatureSize bytes each, owner GUID + data]
//! ```
//!
//! Parsing never fails. Lists of unknown type or with an impossible hash
//! size are stepped over; a size field that cannot be trusted ends the walk.
//! Parsed entries borrow their payload from the input buffer.

use thiserror::Error;
use tracing::debug;

use crate::crypto::SHA256_DIGEST_SIZE;
use crate::drivers::uefi_vars::{guids, EfiGuid};

/// Size of the fixed list header.
pub const LIST_HEADER_SIZE: usize = 28;
/// Size of the owner GUID that starts every signature.
pub const OWNER_SIZE: usize = EfiGuid::SIZE;
/// Bytes a single-certificate list adds on top of its payload.
pub const CERT_ENTRY_OVERHEAD: usize = LIST_HEADER_SIZE + OWNER_SIZE;
/// Signature size of a SHA-256 entry: owner + digest.
pub const SHA256_SIGNATURE_SIZE: usize = OWNER_SIZE + SHA256_DIGEST_SIZE;

/// Entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// DER encoded X.509 certificate
    Certificate,
    /// SHA-256 digest
    Sha256Hash,
}

impl SignatureKind {
    pub fn from_guid(guid: &EfiGuid) -> Option<Self> {
        if *guid == guids::EFI_CERT_X509_GUID {
            Some(Self::Certificate)
        } else if *guid == guids::EFI_CERT_SHA256_GUID {
            Some(Self::Sha256Hash)
        } else {
            None
        }
    }

    pub fn guid(&self) -> EfiGuid {
        match self {
            Self::Certificate => guids::EFI_CERT_X509_GUID,
            Self::Sha256Hash => guids::EFI_CERT_SHA256_GUID,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Certificate => "X.509",
            Self::Sha256Hash => "SHA-256",
        }
    }
}

/// One trust-list member, borrowing its payload from the parsed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureEntry<'a> {
    pub owner: EfiGuid,
    pub kind: SignatureKind,
    pub payload: &'a [u8],
}

/// The signatures region of one well-formed list.
#[derive(Debug, Clone, Copy)]
pub struct RawList<'a> {
    pub kind: SignatureKind,
    pub signature_size: usize,
    signatures: &'a [u8],
}

impl<'a> RawList<'a> {
    /// Every complete signature in the list, in order.
    pub fn entries(self) -> impl Iterator<Item = SignatureEntry<'a>> + 'a {
        let kind = self.kind;
        self.signatures
            .chunks_exact(self.signature_size)
            .filter_map(move |sig| {
                let owner = EfiGuid::from_bytes(sig)?;
                Some(SignatureEntry {
                    owner,
                    kind,
                    payload: &sig[OWNER_SIZE..],
                })
            })
    }
}

/// Outcome of reading the list that starts at a given offset.
#[derive(Debug)]
pub enum ListStep<'a> {
    /// A usable list and the offset of the next one.
    List(RawList<'a>, usize),
    /// A list we do not collect; continue at the offset.
    Skipped(usize),
    /// End of data, or a size field that cannot be trusted.
    End,
}

fn le_u32(buf: &[u8], at: usize) -> Option<usize> {
    let raw: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    usize::try_from(u32::from_le_bytes(raw)).ok()
}

/// Bounds-checked read of the list header at `offset`.
pub fn read_list_at(buf: &[u8], offset: usize) -> ListStep<'_> {
    let Some(rest) = buf.get(offset..) else {
        return ListStep::End;
    };
    if rest.is_empty() {
        return ListStep::End;
    }
    if rest.len() < LIST_HEADER_SIZE {
        debug!("siglist: {} trailing bytes at offset {}, ignored", rest.len(), offset);
        return ListStep::End;
    }

    let (Some(list_size), Some(header_size), Some(signature_size)) =
        (le_u32(rest, 16), le_u32(rest, 20), le_u32(rest, 24))
    else {
        return ListStep::End;
    };

    if list_size == 0 || list_size > rest.len() || list_size < LIST_HEADER_SIZE {
        debug!("siglist: bad list size {} at offset {}, stopping", list_size, offset);
        return ListStep::End;
    }
    let next = offset + list_size;

    let Some(type_guid) = EfiGuid::from_bytes(rest) else {
        return ListStep::End;
    };
    let Some(kind) = SignatureKind::from_guid(&type_guid) else {
        debug!("siglist: skipping list of type {}", type_guid);
        return ListStep::Skipped(next);
    };

    if kind == SignatureKind::Sha256Hash && signature_size != SHA256_SIGNATURE_SIZE {
        debug!("siglist: skipping sha256 list with signature size {}", signature_size);
        return ListStep::Skipped(next);
    }
    if signature_size < OWNER_SIZE {
        debug!("siglist: signature size {} smaller than owner", signature_size);
        return ListStep::Skipped(next);
    }

    let start = match LIST_HEADER_SIZE.checked_add(header_size) {
        Some(start) if start.saturating_add(signature_size) <= list_size => start,
        _ => {
            debug!("siglist: list at offset {} overruns its declared size", offset);
            return ListStep::Skipped(next);
        }
    };

    ListStep::List(
        RawList {
            kind,
            signature_size,
            signatures: &rest[start..list_size],
        },
        next,
    )
}

/// Iterator over the usable lists of a buffer.
#[derive(Debug, Clone)]
pub struct Lists<'a> {
    buf: &'a [u8],
    offset: Option<usize>,
}

impl<'a> Lists<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: Some(0) }
    }
}

impl<'a> Iterator for Lists<'a> {
    type Item = RawList<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let offset = self.offset?;
            match read_list_at(self.buf, offset) {
                ListStep::List(list, next) => {
                    self.offset = Some(next);
                    return Some(list);
                }
                ListStep::Skipped(next) => self.offset = Some(next),
                ListStep::End => {
                    self.offset = None;
                    return None;
                }
            }
        }
    }
}

/// Ordered entries of a signature database. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureList<'a> {
    entries: Vec<SignatureEntry<'a>>,
}

impl<'a> SignatureList<'a> {
    pub fn parse(buf: &'a [u8]) -> Self {
        Self {
            entries: Lists::new(buf).flat_map(RawList::entries).collect(),
        }
    }

    pub fn entries(&self) -> &[SignatureEntry<'a>] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignatureEntry<'a>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact size and byte equality; no certificate-level comparison.
    pub fn contains_payload(&self, payload: &[u8]) -> bool {
        self.entries.iter().any(|e| e.payload == payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("payload of {0} bytes does not fit a signature list")]
    PayloadTooLarge(usize),
}

/// Serializes one single-signature list per pushed payload.
#[derive(Debug, Clone, Default)]
pub struct SignatureListBuilder {
    buf: Vec<u8>,
}

impl SignatureListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a certificate owned by the shim lock GUID.
    pub fn push_certificate(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        self.push(SignatureKind::Certificate, guids::SHIM_LOCK_GUID, payload)
    }

    pub fn push(&mut self, kind: SignatureKind, owner: EfiGuid, payload: &[u8]) -> Result<(), CodecError> {
        let too_large = CodecError::PayloadTooLarge(payload.len());
        let list_size = payload
            .len()
            .checked_add(CERT_ENTRY_OVERHEAD)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(too_large)?;
        let signature_size = list_size - LIST_HEADER_SIZE as u32;

        self.buf.reserve(list_size as usize);
        self.buf.extend_from_slice(&kind.guid().to_bytes());
        self.buf.extend_from_slice(&list_size.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.extend_from_slice(&signature_size.to_le_bytes());
        self.buf.extend_from_slice(&owner.to_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Build a certificate list from raw blobs, one entry per blob, input order.
pub fn build<B: AsRef<[u8]>>(blobs: &[B]) -> Result<Vec<u8>, CodecError> {
    let mut builder = SignatureListBuilder::new();
    for blob in blobs {
        builder.push_certificate(blob.as_ref())?;
    }
    Ok(builder.into_bytes())
}
