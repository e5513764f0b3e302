//! Human-comparable key fingerprints.
//!
//! A fingerprint is derived from the SHA-256 digest of the Ed25519
//! public key: the first 32 hex characters of the digest, grouped into
//! 8 colon-separated blocks of 4. Operators read fingerprints to each
//! other out-of-band to confirm peer identity.

use sha2::{Digest, Sha256};

use crate::signing::PublicKey;

/// Number of hex characters taken from the digest.
const FINGERPRINT_HEX_LEN: usize = 32;

/// Characters per colon-separated group.
const GROUP_LEN: usize = 4;

/// Computes the fingerprint of an Ed25519 public key.
///
/// Format: `xxxx:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx` (lowercase hex).
pub fn fingerprint(public_key: &PublicKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    let hex = hex::encode(digest);

    hex[..FINGERPRINT_HEX_LEN]
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}
