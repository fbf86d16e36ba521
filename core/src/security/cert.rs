//! X.509 probing for diagnostics and listings.
//!
//! Nothing here decides trust; a payload that fails to parse is still a
//! valid request entry, it just earns a warning.

use std::fmt::Write as _;

use x509_cert::der::Decode;
use x509_cert::Certificate;

use super::siglist::{SignatureEntry, SignatureKind};
use crate::crypto::{fingerprint_hex, sha256};

/// True if `data` decodes as a DER X.509 certificate.
pub fn is_valid_der_certificate(data: &[u8]) -> bool {
    Certificate::from_der(data).is_ok()
}

/// Human-readable block for one list entry.
pub fn describe_entry(entry: &SignatureEntry<'_>) -> String {
    match entry.kind {
        SignatureKind::Sha256Hash => format!("SHA256 hash: {}\n", hex::encode(entry.payload)),
        SignatureKind::Certificate => describe_certificate(entry.payload),
    }
}

/// Fingerprint plus, when the payload parses, the certificate's names and
/// validity window.
pub fn describe_certificate(der: &[u8]) -> String {
    let mut out = format!("SHA256 Fingerprint: {}\n", fingerprint_hex(&sha256(der)));

    let cert = match Certificate::from_der(der) {
        Ok(cert) => cert,
        Err(e) => {
            let _ = writeln!(out, "Invalid X509 certificate ({})", e);
            return out;
        }
    };

    let tbs = &cert.tbs_certificate;
    let _ = writeln!(out, "Serial Number: {}", hex::encode(tbs.serial_number.as_bytes()));
    let _ = writeln!(out, "Issuer: {}", tbs.issuer);
    let _ = writeln!(out, "Subject: {}", tbs.subject);
    let _ = writeln!(out, "Not Before: {}", tbs.validity.not_before.to_date_time());
    let _ = writeln!(out, "Not After: {}", tbs.validity.not_after.to_date_time());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::uefi_vars::guids;

    const FIXTURE: &[u8] = include_bytes!("../../tests/fixtures/mok-test.der");

    #[test]
    fn fixture_is_a_certificate() {
        assert!(is_valid_der_certificate(FIXTURE));
        assert!(!is_valid_der_certificate(b"not a certificate"));
        assert!(!is_valid_der_certificate(&FIXTURE[..FIXTURE.len() - 1]));
    }

    #[test]
    fn description_names_subject() {
        let text = describe_certificate(FIXTURE);
        assert!(text.starts_with("SHA256 Fingerprint: "));
        assert!(text.contains("CN=mokreq test key"));
        assert!(text.contains("Not After: "));
    }

    #[test]
    fn garbage_still_gets_a_fingerprint() {
        let text = describe_certificate(b"junk");
        assert!(text.contains(&fingerprint_hex(&sha256(b"junk"))));
        assert!(text.contains("Invalid X509 certificate"));
    }

    #[test]
    fn hash_entries_print_the_digest() {
        let digest = [0x5a; 32];
        let entry = SignatureEntry {
            owner: guids::SHIM_LOCK_GUID,
            kind: SignatureKind::Sha256Hash,
            payload: &digest,
        };
        assert_eq!(describe_entry(&entry), format!("SHA256 hash: {}\n", "5a".repeat(32)));
    }
}
