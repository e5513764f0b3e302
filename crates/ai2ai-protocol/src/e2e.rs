//! Payload encryption via ephemeral X25519 ECDH + AES-256-GCM.
//!
//! Every encrypted payload uses a fresh ephemeral X25519 keypair:
//! compromise of the recipient's long-term key never exposes payloads
//! whose ephemerals were already discarded.
//!
//! # Encryption flow (sender)
//!
//! ```text
//! 1. ephemeral ← X25519.generate()
//! 2. shared ← ECDH(ephemeral, recipient_x25519_pub)
//! 3. key ← HKDF-SHA256(shared, salt="", info="ai2ai-payload-encryption")[..32]
//! 4. nonce ← random 96 bits
//! 5. (ciphertext, tag) ← AES-256-GCM(key, nonce, utf8(json(payload)))
//! 6. carry {ephemeralPub, nonce, ciphertext, tag} base64
//! ```
//!
//! Decryption is the dual with the recipient's static X25519 secret.
//! Any AEAD failure is a hard reject — GCM never yields an incorrect
//! plaintext.

use ai2ai_crypto::aead::{
    decrypt_aes256_gcm, encrypt_aes256_gcm, generate_aead_nonce, AeadNonce, AEAD_NONCE_LEN,
    AEAD_TAG_LEN,
};
use ai2ai_crypto::ecdh::{
    ecdh_derive_shared, ecdh_derive_shared_ephemeral, X25519EphemeralSecret, X25519PublicKey,
    X25519StaticSecret,
};
use ai2ai_crypto::hkdf::hkdf_sha256;
use ai2ai_types::{Ai2AiError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::envelope::{EncryptedMarker, EncryptedPayload};

/// HKDF info label binding derived keys to payload encryption.
const HKDF_INFO: &[u8] = b"ai2ai-payload-encryption";

/// Derived AEAD key length.
const KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

/// Encrypts a plaintext JSON payload for a recipient.
///
/// # Errors
///
/// Returns [`Ai2AiError::Crypto`] if key derivation or encryption
/// fails.
pub fn encrypt_payload(
    payload: &Value,
    recipient_x25519: &X25519PublicKey,
) -> Result<EncryptedPayload> {
    let plaintext = serde_json::to_vec(payload).map_err(|e| Ai2AiError::Crypto {
        reason: format!("payload serialization failed: {e}"),
    })?;

    let ephemeral = X25519EphemeralSecret::generate();
    let ephemeral_pub = ephemeral.public_key();

    let shared = ecdh_derive_shared_ephemeral(ephemeral, recipient_x25519);
    let key = derive_key(shared.as_bytes())?;

    let nonce = generate_aead_nonce();
    let sealed = encrypt_aes256_gcm(&key, &nonce, &plaintext, &[])?;

    Ok(EncryptedPayload {
        encrypted: EncryptedMarker,
        ephemeral_pub: BASE64.encode(ephemeral_pub.as_bytes()),
        nonce: BASE64.encode(nonce.as_bytes()),
        ciphertext: BASE64.encode(&sealed.ciphertext),
        tag: BASE64.encode(sealed.tag),
    })
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

/// Decrypts an [`EncryptedPayload`] with our static X25519 secret.
///
/// # Errors
///
/// - [`Ai2AiError::DecryptionFailed`] when a base64 field is
///   malformed or the AEAD tag does not verify.
pub fn decrypt_payload(
    encrypted: &EncryptedPayload,
    our_secret: &X25519StaticSecret,
) -> Result<Value> {
    let ephemeral_pub = decode_fixed::<32>(&encrypted.ephemeral_pub, "ephemeralPub")?;
    let nonce_bytes = decode_fixed::<AEAD_NONCE_LEN>(&encrypted.nonce, "nonce")?;
    let tag = decode_fixed::<AEAD_TAG_LEN>(&encrypted.tag, "tag")?;
    let ciphertext = BASE64
        .decode(&encrypted.ciphertext)
        .map_err(|_| Ai2AiError::DecryptionFailed {
            reason: "ciphertext is not valid base64".into(),
        })?;

    let shared = ecdh_derive_shared(our_secret, &X25519PublicKey::from_bytes(ephemeral_pub));
    let key = derive_key(shared.as_bytes())?;

    let plaintext = decrypt_aes256_gcm(
        &key,
        &AeadNonce::from_bytes(nonce_bytes),
        &ciphertext,
        &tag,
        &[],
    )?;

    serde_json::from_slice(&plaintext).map_err(|_| Ai2AiError::DecryptionFailed {
        reason: "decrypted payload is not valid JSON".into(),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// HKDF-SHA256 with the protocol label and empty salt.
fn derive_key(shared: &[u8; 32]) -> Result<[u8; KEY_LEN]> {
    hkdf_sha256(shared, b"", HKDF_INFO, KEY_LEN)?.to_aead_key()
}

/// Decodes a base64 field into a fixed-length array.
fn decode_fixed<const N: usize>(encoded: &str, field: &str) -> Result<[u8; N]> {
    let bytes = BASE64.decode(encoded).map_err(|_| Ai2AiError::DecryptionFailed {
        reason: format!("{field} is not valid base64"),
    })?;
    if bytes.len() != N {
        return Err(Ai2AiError::DecryptionFailed {
            reason: format!("{field}: expected {N} bytes, got {}", bytes.len()),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
