//! Key rotation bookkeeping.
//!
//! Rotation metadata lives in `keys/rotation-meta.json`. The node
//! archives the last three public keys so peers can keep verifying
//! envelopes that were in flight when the key changed.

use std::fs;
use std::path::Path;

use ai2ai_crypto::signing::PublicKey;
use ai2ai_types::{Ai2AiError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of archived public keys retained after rotation.
const PREVIOUS_KEYS_RETAINED: usize = 3;

// ---------------------------------------------------------------------------
// RotationOutcome
// ---------------------------------------------------------------------------

/// Result of a completed key rotation.
pub struct RotationOutcome {
    /// The freshly generated public key now in use.
    pub new_public: PublicKey,
    /// The archived public key it replaced.
    pub previous_public: PublicKey,
}

// ---------------------------------------------------------------------------
// RotationMeta
// ---------------------------------------------------------------------------

/// Persisted rotation state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationMeta {
    /// When the current signing key was generated or last rotated.
    last_rotation_at: DateTime<Utc>,
    /// Hex encodings of archived public keys, newest first.
    previous_keys: Vec<String>,
}

impl RotationMeta {
    /// Loads existing metadata, or initializes it with the current
    /// time when none exists yet.
    pub fn load_or_init(dir: &Path) -> Result<Self> {
        let path = dir.join("rotation-meta.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| Ai2AiError::Storage {
                reason: format!("failed to read rotation-meta.json: {e}"),
            })?;
            serde_json::from_str(&raw).map_err(|e| Ai2AiError::Storage {
                reason: format!("failed to parse rotation-meta.json: {e}"),
            })
        } else {
            let meta = Self {
                last_rotation_at: Utc::now(),
                previous_keys: Vec::new(),
            };
            meta.save(dir)?;
            Ok(meta)
        }
    }

    /// Persists the metadata.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to serialize rotation metadata: {e}"),
        })?;
        fs::write(dir.join("rotation-meta.json"), raw).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to write rotation-meta.json: {e}"),
        })
    }

    /// Archives the outgoing public key and stamps the rotation time.
    ///
    /// Keeps only the newest [`PREVIOUS_KEYS_RETAINED`] archived keys.
    pub fn record_rotation(&mut self, outgoing_public_hex: String) {
        self.previous_keys.insert(0, outgoing_public_hex);
        self.previous_keys.truncate(PREVIOUS_KEYS_RETAINED);
        self.last_rotation_at = Utc::now();
    }

    /// Archived public keys, newest first.
    pub fn previous_keys(&self) -> &[String] {
        &self.previous_keys
    }

    /// `true` when `interval_ms` has elapsed since the last rotation.
    pub fn needs_rotation(&self, interval_ms: u64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_rotation_at);
        elapsed.num_milliseconds() > interval_ms as i64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
