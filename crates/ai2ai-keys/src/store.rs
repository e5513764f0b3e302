//! On-disk key store.
//!
//! Layout under `<data_dir>/keys/`:
//!
//! ```text
//! agent.pub          Ed25519 public key, PEM (SPKI)
//! agent.key          Ed25519 private key, PEM (PKCS#8), mode 0600
//! x25519.pub.der     X25519 public key, DER (SPKI)
//! x25519.key.der     X25519 private key, DER (PKCS#8), mode 0600
//! rotation-meta.json rotation bookkeeping
//! ```
//!
//! On first use both keypairs are generated from OS entropy and
//! persisted. Subsequent opens load the existing material. The DER
//! and PEM framing uses the fixed RFC 8410 prefixes for Ed25519 and
//! X25519 — both algorithms have exactly one valid encoding shape, so
//! the prefixes are constants rather than a full ASN.1 writer.

use std::fs;
use std::path::{Path, PathBuf};

use ai2ai_crypto::ecdh::X25519StaticSecret;
use ai2ai_crypto::fingerprint::fingerprint;
use ai2ai_crypto::signing::Keypair;
use ai2ai_types::{Ai2AiError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use zeroize::Zeroize;

use crate::rotation::{RotationMeta, RotationOutcome};

// ---------------------------------------------------------------------------
// RFC 8410 DER prefixes
// ---------------------------------------------------------------------------

/// SPKI prefix for an Ed25519 public key (OID 1.3.101.112).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// PKCS#8 prefix for an Ed25519 private key.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

/// SPKI prefix for an X25519 public key (OID 1.3.101.110).
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// PKCS#8 prefix for an X25519 private key.
const X25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x04, 0x22, 0x04,
    0x20,
];

/// Key material length for both algorithms.
const RAW_KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

/// Owns the node's long-lived signing and key-agreement material.
///
/// A `KeyStore` is a process-private singleton per data directory;
/// two stores over the same directory are a configuration error.
pub struct KeyStore {
    dir: PathBuf,
    signing: Keypair,
    agreement: X25519StaticSecret,
    meta: RotationMeta,
}

impl KeyStore {
    /// Opens the key store under `<data_dir>/keys/`, generating and
    /// persisting fresh keypairs on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Storage`] on any filesystem failure and
    /// [`Ai2AiError::Crypto`] on malformed key files.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("keys");
        fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create key directory: {e}"),
        })?;

        let signing_key_path = dir.join("agent.key");
        let signing = if signing_key_path.exists() {
            load_signing_keypair(&dir)?
        } else {
            let kp = Keypair::generate();
            persist_signing_keypair(&dir, &kp)?;
            tracing::info!(fingerprint = %fingerprint(&kp.public_key()), "generated new Ed25519 identity");
            kp
        };

        let agreement_key_path = dir.join("x25519.key.der");
        let agreement = if agreement_key_path.exists() {
            load_agreement_secret(&dir)?
        } else {
            let secret = X25519StaticSecret::generate();
            persist_agreement_secret(&dir, &secret)?;
            secret
        };

        let meta = RotationMeta::load_or_init(&dir)?;

        Ok(Self {
            dir,
            signing,
            agreement,
            meta,
        })
    }

    /// The Ed25519 signing keypair.
    pub fn signing_keys(&self) -> &Keypair {
        &self.signing
    }

    /// The X25519 key-agreement secret.
    pub fn agreement_keys(&self) -> &X25519StaticSecret {
        &self.agreement
    }

    /// Human-comparable fingerprint of the current signing key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.signing.public_key())
    }

    /// Hex encodings of previously archived Ed25519 public keys,
    /// newest first. Verifier peers accept signatures against any of
    /// these during the rotation grace period.
    pub fn previous_public_keys(&self) -> &[String] {
        self.meta.previous_keys()
    }

    /// `true` when the current key is older than `interval_ms`.
    pub fn needs_rotation(&self, interval_ms: u64) -> bool {
        self.meta.needs_rotation(interval_ms)
    }

    /// Rotates the Ed25519 signing key.
    ///
    /// The current public key is archived (the newest three archived
    /// keys are retained), a fresh pair is generated and persisted,
    /// and the rotation timestamp is updated.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Storage`] if the new material cannot be
    /// persisted. The in-memory keypair only changes after a
    /// successful write.
    pub fn rotate(&mut self) -> Result<RotationOutcome> {
        let previous = self.signing.public_key();
        let fresh = Keypair::generate();

        persist_signing_keypair(&self.dir, &fresh)?;
        self.meta.record_rotation(previous.to_hex());
        self.meta.save(&self.dir)?;

        let outcome = RotationOutcome {
            new_public: fresh.public_key(),
            previous_public: previous,
        };

        self.signing = fresh;
        tracing::info!(
            fingerprint = %self.fingerprint(),
            "rotated Ed25519 signing key"
        );

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Ed25519 persistence (PEM)
// ---------------------------------------------------------------------------

fn persist_signing_keypair(dir: &Path, kp: &Keypair) -> Result<()> {
    let pub_pem = pem_encode("PUBLIC KEY", &der_wrap(&ED25519_SPKI_PREFIX, kp.public_key().as_bytes()));
    write_file(&dir.join("agent.pub"), pub_pem.as_bytes(), false)?;

    let mut seed = kp.seed_bytes();
    let mut der = der_wrap(&ED25519_PKCS8_PREFIX, &seed);
    let key_pem = pem_encode("PRIVATE KEY", &der);
    let result = write_file(&dir.join("agent.key"), key_pem.as_bytes(), true);
    seed.zeroize();
    der.zeroize();
    result
}

fn load_signing_keypair(dir: &Path) -> Result<Keypair> {
    let pem = read_file(&dir.join("agent.key"))?;
    let mut der = pem_decode("PRIVATE KEY", &pem)?;
    let seed = der_unwrap(&ED25519_PKCS8_PREFIX, &der, "agent.key")?;
    let kp = Keypair::from_seed(&seed);
    der.zeroize();
    Ok(kp)
}

// ---------------------------------------------------------------------------
// X25519 persistence (DER)
// ---------------------------------------------------------------------------

fn persist_agreement_secret(dir: &Path, secret: &X25519StaticSecret) -> Result<()> {
    let pub_der = der_wrap(&X25519_SPKI_PREFIX, secret.public_key().as_bytes());
    write_file(&dir.join("x25519.pub.der"), &pub_der, false)?;

    let mut raw = secret.to_raw();
    let mut key_der = der_wrap(&X25519_PKCS8_PREFIX, &raw);
    let result = write_file(&dir.join("x25519.key.der"), &key_der, true);
    raw.zeroize();
    key_der.zeroize();
    result
}

fn load_agreement_secret(dir: &Path) -> Result<X25519StaticSecret> {
    let mut der = fs::read(dir.join("x25519.key.der")).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to read x25519.key.der: {e}"),
    })?;
    let raw = der_unwrap(&X25519_PKCS8_PREFIX, &der, "x25519.key.der")?;
    let secret = X25519StaticSecret::from_raw(raw);
    der.zeroize();
    Ok(secret)
}

// ---------------------------------------------------------------------------
// DER / PEM helpers
// ---------------------------------------------------------------------------

/// Concatenates a fixed DER prefix and 32 bytes of key material.
fn der_wrap(prefix: &[u8], key: &[u8; RAW_KEY_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + RAW_KEY_LEN);
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

/// Strips a fixed DER prefix, returning the trailing 32 key bytes.
fn der_unwrap(prefix: &[u8], der: &[u8], what: &str) -> Result<[u8; RAW_KEY_LEN]> {
    if der.len() != prefix.len() + RAW_KEY_LEN || &der[..prefix.len()] != prefix {
        return Err(Ai2AiError::Crypto {
            reason: format!("{what}: unrecognized DER structure"),
        });
    }
    let mut key = [0u8; RAW_KEY_LEN];
    key.copy_from_slice(&der[prefix.len()..]);
    Ok(key)
}

/// Wraps DER bytes in PEM armor with 64-character lines.
fn pem_encode(label: &str, der: &[u8]) -> String {
    let b64 = BASE64.encode(der);
    let mut body = String::with_capacity(b64.len() + b64.len() / 64 + 2);
    for chunk in b64.as_bytes().chunks(64) {
        body.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        body.push('\n');
    }
    format!("-----BEGIN {label}-----\n{body}-----END {label}-----\n")
}

/// Extracts DER bytes from PEM armor.
fn pem_decode(label: &str, pem: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = pem.find(&begin).ok_or_else(|| Ai2AiError::Crypto {
        reason: format!("PEM missing '{begin}' header"),
    })? + begin.len();
    let stop = pem.find(&end).ok_or_else(|| Ai2AiError::Crypto {
        reason: format!("PEM missing '{end}' footer"),
    })?;

    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(&body).map_err(|e| Ai2AiError::Crypto {
        reason: format!("PEM body is not valid base64: {e}"),
    })
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    fs::write(path, contents).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to write {}: {e}", path.display()),
    })?;

    if private {
        restrict_permissions(path)?;
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to read {}: {e}", path.display()),
    })
}

/// Sets owner-read/write-only permissions on private key files.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        Ai2AiError::Storage {
            reason: format!("failed to restrict permissions on {}: {e}", path.display()),
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
