//! Persistent outbound delivery queue.
//!
//! One JSON document per entry under `queue/`. Entries survive
//! restarts with their attempt counts intact; the queue worker drains
//! them on the coarse retry schedule and moves exhausted entries to
//! the dead letter store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{Ai2AiError, EnvelopeId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;

// ---------------------------------------------------------------------------
// QueueStatus / QueueEntry
// ---------------------------------------------------------------------------

/// Lifecycle state of a queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for its next delivery attempt.
    Pending,
    /// A delivery attempt is in flight.
    Retrying,
    /// Delivered; the document is about to be removed.
    Delivered,
    /// Attempts exhausted; moved to the dead letter store.
    Failed,
    /// TTL elapsed before delivery succeeded.
    Expired,
}

/// A queued outbound envelope with retry metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Entry id; equals the envelope id.
    pub id: EnvelopeId,
    /// The signed envelope to deliver.
    pub envelope: Envelope,
    /// Destination endpoint URL.
    pub endpoint: String,
    /// Higher dequeues first.
    pub priority: i32,
    /// When the entry was enqueued.
    pub created_at: DateTime<Utc>,
    /// Give-up deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Time of the most recent attempt.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Error from the most recent attempt.
    pub last_error: Option<String>,
    /// Lifecycle state.
    pub status: QueueStatus,
}

/// Options for [`DeliveryQueue::enqueue`].
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Higher dequeues first. Default 0.
    pub priority: i32,
    /// Give-up deadline; `None` keeps retrying until the schedule is
    /// exhausted.
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// DeliveryQueue
// ---------------------------------------------------------------------------

/// Disk-backed outbound queue.
pub struct DeliveryQueue {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DeliveryQueue {
    /// Opens the queue rooted at `<data_dir>/queue/`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("queue");
        std::fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Persists a new entry and returns its id.
    pub fn enqueue(
        &self,
        envelope: Envelope,
        endpoint: String,
        opts: EnqueueOptions,
    ) -> Result<EnvelopeId> {
        let _guard = self.guard()?;

        let entry = QueueEntry {
            id: envelope.id,
            envelope,
            endpoint,
            priority: opts.priority,
            created_at: Utc::now(),
            expires_at: opts.expires_at,
            attempts: 0,
            last_attempt: None,
            last_error: None,
            status: QueueStatus::Pending,
        };
        self.save(&entry)?;
        Ok(entry.id)
    }

    /// Returns the highest-priority pending entry whose expiry has not
    /// passed, marking entries found expired along the way.
    ///
    /// Ties break oldest-first. The returned entry stays `pending` on
    /// disk; the delivery path calls [`complete`](Self::complete) or
    /// [`fail`](Self::fail) afterwards.
    pub fn dequeue(&self) -> Result<Option<QueueEntry>> {
        let _guard = self.guard()?;
        let now = Utc::now();

        let mut best: Option<QueueEntry> = None;
        for path in atomic::list_documents(&self.dir)? {
            let mut entry: QueueEntry = atomic::read_json(&path)?;
            if entry.status != QueueStatus::Pending {
                continue;
            }

            if entry.expires_at.is_some_and(|at| now >= at) {
                entry.status = QueueStatus::Expired;
                self.save(&entry)?;
                continue;
            }

            let better = match &best {
                None => true,
                Some(current) => {
                    entry.priority > current.priority
                        || (entry.priority == current.priority
                            && entry.created_at < current.created_at)
                }
            };
            if better {
                best = Some(entry);
            }
        }
        Ok(best)
    }

    /// Returns the entry with `id`, if present.
    pub fn get(&self, id: &EnvelopeId) -> Result<Option<QueueEntry>> {
        let _guard = self.guard()?;
        self.load(id)
    }

    /// Lists every entry (all states).
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let _guard = self.guard()?;
        let mut entries = Vec::new();
        for path in atomic::list_documents(&self.dir)? {
            entries.push(atomic::read_json(&path)?);
        }
        Ok(entries)
    }

    /// Deletes a delivered entry.
    pub fn complete(&self, id: &EnvelopeId) -> Result<()> {
        let _guard = self.guard()?;
        atomic::remove(&self.path(id))
    }

    /// Records a failed attempt: bumps `attempts`, stamps
    /// `last_attempt`, stores the error, and leaves the entry pending
    /// for the next retry.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Storage`] when the entry is missing.
    pub fn fail(&self, id: &EnvelopeId, error: &str) -> Result<QueueEntry> {
        let _guard = self.guard()?;

        let mut entry = self.load(id)?.ok_or_else(|| Ai2AiError::Storage {
            reason: format!("queue entry {id} not found"),
        })?;

        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt = Some(Utc::now());
        entry.last_error = Some(error.to_owned());
        entry.status = QueueStatus::Pending;
        self.save(&entry)?;
        Ok(entry)
    }

    /// Marks an entry failed-terminal and removes it, returning the
    /// final record for dead-lettering.
    pub fn fail_terminal(&self, id: &EnvelopeId) -> Result<Option<QueueEntry>> {
        let _guard = self.guard()?;

        let Some(mut entry) = self.load(id)? else {
            return Ok(None);
        };
        entry.status = QueueStatus::Failed;
        atomic::remove(&self.path(id))?;
        Ok(Some(entry))
    }

    /// Number of pending entries.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .count())
    }

    // -- Internal ---------------------------------------------------------

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|e| Ai2AiError::Storage {
            reason: format!("delivery queue lock poisoned: {e}"),
        })
    }

    fn path(&self, id: &EnvelopeId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn load(&self, id: &EnvelopeId) -> Result<Option<QueueEntry>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        atomic::read_json(&path).map(Some)
    }

    fn save(&self, entry: &QueueEntry) -> Result<()> {
        atomic::write_json(&self.path(&entry.id), entry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ai2ai_protocol::envelope::{EnvelopeBuilder, Party};
    use ai2ai_types::{AgentId, ConversationId, EnvelopeType};
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"))
    }

    fn envelope() -> Envelope {
        EnvelopeBuilder::new(
            Party {
                agent: AgentId::new("alice.example"),
                human: "Alice".into(),
            },
            AgentId::new("bob.example"),
            ConversationId::generate(),
            EnvelopeType::Message,
        )
        .build()
    }

    const ENDPOINT: &str = "http://bob:18800/ai2ai";

    #[test]
    fn enqueue_dequeue_roundtrip() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;

        let id = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
        let entry = queue.dequeue()?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;

        assert_eq!(entry.id, id);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.status, QueueStatus::Pending);
        Ok(())
    }

    #[test]
    fn priority_order() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;

        queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
        let urgent = queue.enqueue(
            envelope(),
            ENDPOINT.into(),
            EnqueueOptions {
                priority: 10,
                expires_at: None,
            },
        )?;

        let entry = queue.dequeue()?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.id, urgent);
        Ok(())
    }

    #[test]
    fn equal_priority_oldest_first() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;

        let first = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;

        let entry = queue.dequeue()?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.id, first);
        Ok(())
    }

    #[test]
    fn complete_removes_entry() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;

        let id = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
        queue.complete(&id)?;

        assert!(queue.get(&id)?.is_none());
        assert!(queue.dequeue()?.is_none());
        Ok(())
    }

    #[test]
    fn fail_increments_attempts() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;
        let id = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;

        queue.fail(&id, "connection refused")?;
        let entry = queue.fail(&id, "connection refused")?;

        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
        assert!(entry.last_attempt.is_some());
        // Still pending, eligible for the next retry tick.
        assert_eq!(entry.status, QueueStatus::Pending);
        Ok(())
    }

    #[test]
    fn expired_entries_marked_in_place() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;

        let id = queue.enqueue(
            envelope(),
            ENDPOINT.into(),
            EnqueueOptions {
                priority: 0,
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        )?;

        assert!(queue.dequeue()?.is_none());
        let entry = queue.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.status, QueueStatus::Expired);
        Ok(())
    }

    #[test]
    fn fail_terminal_removes_and_returns() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let queue = DeliveryQueue::open(dir.path())?;
        let id = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
        queue.fail(&id, "refused")?;

        let entry = queue.fail_terminal(&id)?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.status, QueueStatus::Failed);
        assert!(queue.get(&id)?.is_none());
        Ok(())
    }

    #[test]
    fn durability_across_reopen() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let id;
        {
            let queue = DeliveryQueue::open(dir.path())?;
            id = queue.enqueue(envelope(), ENDPOINT.into(), EnqueueOptions::default())?;
            queue.fail(&id, "refused")?;
            queue.fail(&id, "refused")?;
        }

        // "Restart": attempts and metadata survive.
        let queue = DeliveryQueue::open(dir.path())?;
        let entry = queue.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.endpoint, ENDPOINT);
        Ok(())
    }

    #[test]
    fn expiry_honored_across_reopen() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let id;
        {
            let queue = DeliveryQueue::open(dir.path())?;
            id = queue.enqueue(
                envelope(),
                ENDPOINT.into(),
                EnqueueOptions {
                    priority: 0,
                    expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                },
            )?;
        }

        let queue = DeliveryQueue::open(dir.path())?;
        assert!(queue.dequeue()?.is_none());
        let entry = queue.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "entry missing".into(),
        })?;
        assert_eq!(entry.status, QueueStatus::Expired);
        Ok(())
    }
}
