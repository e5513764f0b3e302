//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Derives symmetric AEAD keys from X25519 shared secrets. The output
//! is automatically zeroized on drop to minimize the time sensitive
//! material resides in memory.

use ai2ai_types::{Ai2AiError, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum output length in bytes.
///
/// HKDF-SHA256 can produce up to `255 × 32 = 8160` bytes, but we cap
/// at 64 to prevent misuse. Typical usage is 32 bytes (one AES-256
/// key).
const MAX_OUTPUT_LEN: usize = 64;

// ---------------------------------------------------------------------------
// HkdfOutput
// ---------------------------------------------------------------------------

/// Key material derived by HKDF-SHA256, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HkdfOutput {
    bytes: Vec<u8>,
}

impl HkdfOutput {
    /// Returns the derived key material as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the length of the derived key material.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the output is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copies the first 32 bytes into a fixed AEAD key array.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Crypto`] if fewer than 32 bytes were
    /// derived.
    pub fn to_aead_key(&self) -> Result<[u8; 32]> {
        if self.bytes.len() < 32 {
            return Err(Ai2AiError::Crypto {
                reason: format!("derived {} bytes, need 32 for an AEAD key", self.bytes.len()),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.bytes[..32]);
        Ok(key)
    }
}

// HkdfOutput does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derives key material from input keying material using HKDF-SHA256.
///
/// # Parameters
///
/// - `ikm` — input keying material (an ECDH shared secret).
/// - `salt` — optional salt. An empty slice is valid per RFC 5869
///   §3.1; the implementation substitutes a zero-filled salt of hash
///   length in that case.
/// - `info` — context label binding the derived key to its purpose.
/// - `output_len` — desired output length in bytes, `1..=64`.
///
/// # Errors
///
/// Returns [`Ai2AiError::Crypto`] if `output_len` is 0 or exceeds 64,
/// or if HKDF expansion fails.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Result<HkdfOutput> {
    if output_len == 0 {
        return Err(Ai2AiError::Crypto {
            reason: "HKDF output length must be at least 1 byte".into(),
        });
    }

    if output_len > MAX_OUTPUT_LEN {
        return Err(Ai2AiError::Crypto {
            reason: format!("HKDF output length {output_len} exceeds maximum {MAX_OUTPUT_LEN}"),
        });
    }

    // Empty salt → zeroed salt per the HKDF spec.
    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };

    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm).map_err(|e| Ai2AiError::Crypto {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;

    Ok(HkdfOutput { bytes: okm })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
