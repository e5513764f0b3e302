//! Dead letter store.
//!
//! Terminal resting place for deliveries the engine gave up on. One
//! JSON document per entry under `dlq/`; nothing here is retried
//! automatically — recovery is operator-triggered via
//! [`DeadLetterStore::retry_all`].

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{Ai2AiError, EnvelopeId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;

// ---------------------------------------------------------------------------
// DeadLetter
// ---------------------------------------------------------------------------

/// A permanently failed delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Entry id; equals the envelope id.
    pub id: EnvelopeId,
    /// The undeliverable envelope.
    pub envelope: Envelope,
    /// Destination that kept failing.
    pub endpoint: String,
    /// The final error.
    pub error: String,
    /// Total delivery attempts made before giving up.
    pub attempts: u32,
    /// When the delivery was abandoned.
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DeadLetterStore
// ---------------------------------------------------------------------------

/// Disk-backed dead letter store.
pub struct DeadLetterStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterStore {
    /// Opens the store rooted at `<data_dir>/dlq/`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("dlq");
        std::fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Records a permanently failed delivery.
    pub fn push(
        &self,
        envelope: Envelope,
        endpoint: String,
        error: String,
        attempts: u32,
    ) -> Result<()> {
        let _guard = self.guard()?;

        let letter = DeadLetter {
            id: envelope.id,
            envelope,
            endpoint,
            error,
            attempts,
            failed_at: Utc::now(),
        };
        atomic::write_json(&self.path(&letter.id), &letter)
    }

    /// Lists all dead letters, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetter>> {
        let _guard = self.guard()?;
        let mut letters: Vec<DeadLetter> = Vec::new();
        for path in atomic::list_documents(&self.dir)? {
            letters.push(atomic::read_json(&path)?);
        }
        letters.sort_by_key(|l| l.failed_at);
        Ok(letters)
    }

    /// Number of dead letters.
    pub fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// `true` when the store is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Attempts each dead letter exactly once via `send`, removing the
    /// entries that succeed. Returns `(delivered, remaining)` counts.
    pub fn retry_all<F>(&self, mut send: F) -> Result<(usize, usize)>
    where
        F: FnMut(&DeadLetter) -> Result<()>,
    {
        let letters = self.list()?;
        let mut delivered = 0;

        for letter in &letters {
            match send(letter) {
                Ok(()) => {
                    let _guard = self.guard()?;
                    atomic::remove(&self.path(&letter.id))?;
                    delivered += 1;
                }
                Err(e) => {
                    tracing::debug!(id = %letter.id, error = %e, "dead letter retry failed");
                }
            }
        }

        Ok((delivered, letters.len() - delivered))
    }

    // -- Internal ---------------------------------------------------------

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|e| Ai2AiError::Storage {
            reason: format!("dead letter store lock poisoned: {e}"),
        })
    }

    fn path(&self, id: &EnvelopeId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
