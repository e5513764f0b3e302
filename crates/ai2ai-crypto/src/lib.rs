//! Cryptographic primitives for the ai2ai protocol.
//!
//! Everything envelope security needs, and nothing more:
//!
//! - [`signing`] — Ed25519 keypairs, signing, verification
//! - [`ecdh`] — X25519 key agreement (static + ephemeral)
//! - [`hkdf`] — HKDF-SHA256 key derivation
//! - [`aead`] — AES-256-GCM with a detached 128-bit tag
//! - [`fingerprint`] — human-comparable key fingerprints

pub mod aead;
pub mod ecdh;
pub mod fingerprint;
pub mod hkdf;
pub mod signing;
