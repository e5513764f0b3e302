//! AES-256-GCM authenticated encryption with a detached tag.
//!
//! The envelope wire format carries `nonce`, `ciphertext`, and `tag`
//! as separate base64 fields, so this module exposes the 128-bit
//! authentication tag detached from the ciphertext rather than
//! appended to it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ai2ai_types::{Ai2AiError, Result};
use rand::RngCore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// AES-256-GCM nonce length (96 bits).
pub const AEAD_NONCE_LEN: usize = 12;

/// GCM authentication tag length (128 bits).
pub const AEAD_TAG_LEN: usize = 16;

/// Symmetric key length (AES-256).
pub const AEAD_KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// AeadNonce
// ---------------------------------------------------------------------------

/// 96-bit AEAD nonce, unique per encryption.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AeadNonce([u8; AEAD_NONCE_LEN]);

impl AeadNonce {
    /// Creates an [`AeadNonce`] from raw bytes.
    pub fn from_bytes(bytes: [u8; AEAD_NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; AEAD_NONCE_LEN] {
        &self.0
    }
}

/// Generates a random 96-bit nonce from OS entropy.
pub fn generate_aead_nonce() -> AeadNonce {
    let mut bytes = [0u8; AEAD_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    AeadNonce(bytes)
}

// ---------------------------------------------------------------------------
// Sealed
// ---------------------------------------------------------------------------

/// Output of [`encrypt_aes256_gcm`]: ciphertext and detached tag.
pub struct Sealed {
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// 128-bit GCM authentication tag.
    pub tag: [u8; AEAD_TAG_LEN],
}

// ---------------------------------------------------------------------------
// Encrypt / decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` under `key` with AES-256-GCM.
///
/// The returned [`Sealed`] carries the tag detached, matching the
/// envelope wire format.
///
/// # Errors
///
/// Returns [`Ai2AiError::Crypto`] if encryption fails (malformed key;
/// never for well-formed inputs).
pub fn encrypt_aes256_gcm(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &AeadNonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let combined = cipher
        .encrypt(
            Nonce::from_slice(&nonce.0),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Ai2AiError::Crypto {
            reason: "AES-256-GCM encryption failed".into(),
        })?;

    // aes-gcm appends the tag; the wire format wants it detached.
    let split = combined.len().saturating_sub(AEAD_TAG_LEN);
    let mut tag = [0u8; AEAD_TAG_LEN];
    tag.copy_from_slice(&combined[split..]);

    Ok(Sealed {
        ciphertext: combined[..split].to_vec(),
        tag,
    })
}

/// Decrypts a ciphertext + detached tag produced by
/// [`encrypt_aes256_gcm`].
///
/// # Errors
///
/// Returns [`Ai2AiError::DecryptionFailed`] when the tag does not
/// verify (wrong key, tampered ciphertext, wrong nonce). GCM never
/// yields an incorrect plaintext: authentication failure is the only
/// failure mode.
pub fn decrypt_aes256_gcm(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &AeadNonce,
    ciphertext: &[u8],
    tag: &[u8; AEAD_TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut combined = Vec::with_capacity(ciphertext.len() + AEAD_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce.0),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| Ai2AiError::DecryptionFailed {
            reason: "AEAD tag verification failed".into(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
