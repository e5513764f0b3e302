//! X25519 Elliptic-Curve Diffie-Hellman key agreement.
//!
//! Each node carries a long-lived X25519 identity alongside its
//! Ed25519 signing identity. Payload encryption performs ECDH between
//! a per-envelope ephemeral secret and the recipient's static public
//! key, so compromise of a discarded ephemeral never exposes other
//! envelopes.

use rand::rngs::OsRng;
use zeroize::Zeroize;

// ---------------------------------------------------------------------------
// X25519PublicKey
// ---------------------------------------------------------------------------

/// X25519 public key (32 bytes) for Diffie-Hellman key agreement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct X25519PublicKey(x25519_dalek::PublicKey);

impl X25519PublicKey {
    /// Fixed byte length of an X25519 public key.
    pub const LEN: usize = 32;

    /// Creates an [`X25519PublicKey`] from raw 32-byte Montgomery-form
    /// representation.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Returns the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

// ---------------------------------------------------------------------------
// X25519StaticSecret
// ---------------------------------------------------------------------------

/// Long-lived X25519 secret key.
///
/// The underlying `x25519-dalek` [`StaticSecret`](x25519_dalek::StaticSecret)
/// zeroizes its memory on drop.
pub struct X25519StaticSecret(x25519_dalek::StaticSecret);

impl X25519StaticSecret {
    /// Generates a fresh static secret from OS entropy.
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Creates an [`X25519StaticSecret`] from raw 32-byte key material.
    ///
    /// Clamping is performed internally by `x25519-dalek` during scalar
    /// multiplication, so the raw bytes are stored as-is.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Returns the raw secret bytes for persistence.
    ///
    /// # Security
    ///
    /// Callers must write the copy to owner-read-only storage and
    /// zeroize any intermediate buffers.
    pub fn to_raw(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

// X25519StaticSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// X25519EphemeralSecret
// ---------------------------------------------------------------------------

/// Single-use ephemeral X25519 secret key.
///
/// Generated per envelope, used for one ECDH, then discarded.
pub struct X25519EphemeralSecret {
    /// Stored as [`StaticSecret`](x25519_dalek::StaticSecret) because
    /// `x25519_dalek::EphemeralSecret` is consumed on `diffie_hellman`
    /// and the public key must be extracted *before* ECDH runs.
    inner: x25519_dalek::StaticSecret,
}

impl X25519EphemeralSecret {
    /// Generates a fresh ephemeral secret from OS entropy.
    pub fn generate() -> Self {
        Self {
            inner: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Returns the public key corresponding to this ephemeral secret.
    ///
    /// The sender embeds this key in the encrypted payload so the
    /// recipient can derive the same shared secret.
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(x25519_dalek::PublicKey::from(&self.inner))
    }
}

// X25519EphemeralSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Shared secret derived from an X25519 Diffie-Hellman exchange.
///
/// Automatically zeroized on drop. Always passed through HKDF before
/// use as an AEAD key.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Returns the raw 32-byte shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// ECDH functions
// ---------------------------------------------------------------------------

/// Performs X25519 ECDH with a static (long-lived) secret key.
///
/// Both parties performing this operation with the other's public key
/// derive the identical shared secret.
pub fn ecdh_derive_shared(
    our_secret: &X25519StaticSecret,
    their_public: &X25519PublicKey,
) -> SharedSecret {
    let raw = our_secret.0.diffie_hellman(&their_public.0);
    SharedSecret(*raw.as_bytes())
}

/// Performs X25519 ECDH with an ephemeral (single-use) secret key.
///
/// The ephemeral secret is consumed and cannot be reused.
pub fn ecdh_derive_shared_ephemeral(
    our_secret: X25519EphemeralSecret,
    their_public: &X25519PublicKey,
) -> SharedSecret {
    let raw = our_secret.inner.diffie_hellman(&their_public.0);
    SharedSecret(*raw.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_ecdh_shared_secret_matches() {
        let a = X25519StaticSecret::generate();
        let b = X25519StaticSecret::generate();
        let pub_a = a.public_key();
        let pub_b = b.public_key();

        let shared_ab = ecdh_derive_shared(&a, &pub_b);
        let shared_ba = ecdh_derive_shared(&b, &pub_a);
        assert_eq!(shared_ab.as_bytes(), shared_ba.as_bytes());
    }

    #[test]
    fn ephemeral_ecdh_shared_secret_matches() {
        let stat = X25519StaticSecret::generate();
        let stat_pub = stat.public_key();

        let eph = X25519EphemeralSecret::generate();
        let eph_pub = eph.public_key();

        let shared_eph = ecdh_derive_shared_ephemeral(eph, &stat_pub);
        let shared_static = ecdh_derive_shared(&stat, &eph_pub);
        assert_eq!(shared_eph.as_bytes(), shared_static.as_bytes());
    }

    #[test]
    fn from_raw_roundtrip() {
        let secret = X25519StaticSecret::generate();
        let raw = secret.to_raw();
        let restored = X25519StaticSecret::from_raw(raw);
        assert_eq!(
            secret.public_key().as_bytes(),
            restored.public_key().as_bytes(),
        );
    }

    #[test]
    fn different_keys_produce_different_shared_secrets() {
        let a = X25519EphemeralSecret::generate();
        let b = X25519EphemeralSecret::generate();
        let c = X25519StaticSecret::generate();
        let pub_c = c.public_key();

        let shared_ac = ecdh_derive_shared_ephemeral(a, &pub_c);
        let shared_bc = ecdh_derive_shared_ephemeral(b, &pub_c);
        assert_ne!(shared_ac.as_bytes(), shared_bc.as_bytes());
    }
}
