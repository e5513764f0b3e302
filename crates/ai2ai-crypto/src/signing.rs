//! Ed25519 digital signature operations.
//!
//! Provides keypair generation, envelope signing, and signature
//! verification. The private key is automatically zeroized on drop via
//! `ed25519-dalek`'s built-in `ZeroizeOnDrop`.

use ai2ai_types::{Ai2AiError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// Ed25519 public key (32 bytes).
///
/// Wrapper around the raw verifying key bytes. On the wire and at rest
/// the key travels as lowercase hex.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Fixed byte length of an Ed25519 public key.
    pub const LEN: usize = 32;

    /// Creates a [`PublicKey`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a [`PublicKey`] from its hex representation.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Crypto`] on invalid hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Ai2AiError::Crypto {
            reason: "invalid hex encoding for public key".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(Ai2AiError::Crypto {
                reason: format!("expected {} bytes for public key, got {}", Self::LEN, bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the underlying 32-byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Ed25519 signature (64 bytes).
///
/// On the wire the signature travels as standard base64 with padding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Fixed byte length of an Ed25519 signature.
    pub const LEN: usize = 64;

    /// Creates a [`Signature`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parses a [`Signature`] from its base64 wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::InvalidSignature`] on invalid base64 or
    /// wrong length.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64.decode(s).map_err(|_| Ai2AiError::InvalidSignature {
            reason: "signature is not valid base64".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(Ai2AiError::InvalidSignature {
                reason: format!("expected {} signature bytes, got {}", Self::LEN, bytes.len()),
            });
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the underlying 64-byte array.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Returns the base64 wire form (standard alphabet, padded).
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// Ed25519 signing keypair.
///
/// Wraps an `ed25519-dalek` [`SigningKey`]. The private key is
/// automatically zeroized when this struct is dropped.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair using OS-level entropy.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstructs a keypair deterministically from a 32-byte seed.
    ///
    /// Given the same seed, this always produces the same keypair.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Returns the public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs an arbitrary message and returns the Ed25519 signature.
    ///
    /// Deterministic: the same keypair + message always yields the
    /// same signature (RFC 8032).
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature(sig.to_bytes())
    }

    /// Returns the 32-byte seed of this keypair.
    ///
    /// # Security
    ///
    /// The returned bytes are sensitive key material. Callers must
    /// zeroize or discard the copy as soon as it is no longer needed.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

// Keypair intentionally does not implement Clone or Debug to prevent
// accidental leakage of the private key in logs or copies.

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Verifies an Ed25519 signature against a public key and message.
///
/// # Errors
///
/// Returns [`Ai2AiError::InvalidSignature`] if the key is malformed or
/// verification fails.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let vk = VerifyingKey::from_bytes(&public_key.0).map_err(|e| {
        Ai2AiError::InvalidSignature {
            reason: format!("invalid public key: {e}"),
        }
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    vk.verify_strict(message, &sig)
        .map_err(|e| Ai2AiError::InvalidSignature {
            reason: format!("signature verification failed: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_valid_keypair() {
        let kp = Keypair::generate();
        let msg = b"test message";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public_key(), msg, &sig).is_ok());
    }

    #[test]
    fn from_seed_is_deterministic() {
        let seed = [0x42u8; 32];
        let kp1 = Keypair::from_seed(&seed);
        let kp2 = Keypair::from_seed(&seed);
        assert_eq!(kp1.public_key(), kp2.public_key());

        let msg = b"determinism";
        assert_eq!(kp1.sign(msg).as_bytes(), kp2.sign(msg).as_bytes());
    }

    #[test]
    fn wrong_message_fails_verification() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"correct message");
        assert!(verify(&kp.public_key(), b"wrong message", &sig).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        let sig = kp1.sign(b"test");
        assert!(verify(&kp2.public_key(), b"test", &sig).is_err());
    }

    #[test]
    fn signature_base64_roundtrip() -> std::result::Result<(), ai2ai_types::Ai2AiError> {
        let kp = Keypair::from_seed(&[0x01; 32]);
        let sig = kp.sign(b"wire form");
        let encoded = sig.to_base64();
        let decoded = Signature::from_base64(&encoded)?;
        assert_eq!(sig, decoded);
        Ok(())
    }

    #[test]
    fn signature_base64_rejects_garbage() {
        assert!(Signature::from_base64("!!not base64!!").is_err());
        assert!(Signature::from_base64("dG9vIHNob3J0").is_err());
    }

    #[test]
    fn public_key_hex_roundtrip() -> std::result::Result<(), ai2ai_types::Ai2AiError> {
        let kp = Keypair::from_seed(&[0x07; 32]);
        let pk = kp.public_key();
        let parsed = PublicKey::from_hex(&pk.to_hex())?;
        assert_eq!(pk, parsed);
        Ok(())
    }

    #[test]
    fn public_key_hex_rejects_wrong_length() {
        assert!(PublicKey::from_hex("abcd").is_err());
    }
}
