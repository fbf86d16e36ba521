//! Hashing helpers.

use sha2::{Digest, Sha256};

/// SHA-256 digest (32 bytes)
pub type Sha256Digest = [u8; 32];

pub const SHA256_DIGEST_SIZE: usize = 32;

pub fn sha256(data: &[u8]) -> Sha256Digest {
    Sha256::digest(data).into()
}

/// Colon-separated lowercase hex, one group per byte.
pub fn fingerprint_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 {
            hex.push(':');
        }
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
