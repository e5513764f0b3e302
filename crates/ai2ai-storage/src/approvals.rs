//! Durable pending-approval inbox.
//!
//! One JSON document per approval under `pending/`, keyed by the
//! originating envelope id so a replayed request can never create a
//! second approval. Resolution is an atomic file replacement; resolved
//! approvals linger for audit until the maintenance sweep purges them.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{Ai2AiError, EnvelopeId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;

// ---------------------------------------------------------------------------
// PendingApproval
// ---------------------------------------------------------------------------

/// A durable record of an inbound request awaiting operator action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Approval id; equals the envelope id.
    pub id: EnvelopeId,
    /// The envelope held for review.
    pub envelope: Envelope,
    /// Human-readable summary shown to the operator.
    pub approval_text: String,
    /// When the approval was enqueued.
    pub created_at: DateTime<Utc>,
    /// Whether the operator (or the TTL sweep) has acted.
    pub resolved: bool,
    /// The decision, when resolved.
    pub approved: Option<bool>,
    /// Free-text reply the operator attached, if any.
    pub human_reply: Option<String>,
    /// When the decision was recorded.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Whether the operator has been notified about this approval.
    pub notified: bool,
}

// ---------------------------------------------------------------------------
// ApprovalStore
// ---------------------------------------------------------------------------

/// Disk-backed approval inbox.
pub struct ApprovalStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ApprovalStore {
    /// Opens the store rooted at `<data_dir>/pending/`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("pending");
        std::fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Enqueues an approval for `envelope`.
    ///
    /// At most one approval exists per envelope id: re-enqueueing an
    /// id returns the existing record unchanged.
    pub fn enqueue(&self, envelope: Envelope, approval_text: String) -> Result<PendingApproval> {
        let _guard = self.guard()?;

        let id = envelope.id;
        if let Some(existing) = self.load(&id)? {
            return Ok(existing);
        }

        let approval = PendingApproval {
            id,
            envelope,
            approval_text,
            created_at: Utc::now(),
            resolved: false,
            approved: None,
            human_reply: None,
            resolved_at: None,
            notified: false,
        };
        self.save(&approval)?;
        Ok(approval)
    }

    /// Returns the approval with `id`, if present.
    pub fn get(&self, id: &EnvelopeId) -> Result<Option<PendingApproval>> {
        let _guard = self.guard()?;
        self.load(id)
    }

    /// Lists unresolved approvals, oldest first.
    ///
    /// Creation order doubles as processing order for approvals of
    /// the same conversation.
    pub fn list_unresolved(&self) -> Result<Vec<PendingApproval>> {
        let mut pending: Vec<PendingApproval> = self
            .list_all()?
            .into_iter()
            .filter(|a| !a.resolved)
            .collect();
        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }

    /// Records the operator's decision.
    ///
    /// # Errors
    ///
    /// - [`Ai2AiError::Resolution`] for an unknown approval id.
    /// - [`Ai2AiError::InvalidTransition`] when already resolved.
    pub fn resolve(
        &self,
        id: &EnvelopeId,
        approved: bool,
        human_reply: Option<String>,
    ) -> Result<PendingApproval> {
        let _guard = self.guard()?;

        let mut approval = self.load(id)?.ok_or_else(|| Ai2AiError::Resolution {
            reason: format!("unknown approval {id}"),
        })?;

        if approval.resolved {
            return Err(Ai2AiError::InvalidTransition {
                reason: format!("approval {id} is already resolved"),
            });
        }

        approval.resolved = true;
        approval.approved = Some(approved);
        approval.human_reply = human_reply;
        approval.resolved_at = Some(Utc::now());
        self.save(&approval)?;
        Ok(approval)
    }

    /// Marks an approval as notified to the operator.
    pub fn mark_notified(&self, id: &EnvelopeId) -> Result<()> {
        let _guard = self.guard()?;
        if let Some(mut approval) = self.load(id)? {
            if !approval.notified {
                approval.notified = true;
                self.save(&approval)?;
            }
        }
        Ok(())
    }

    /// Auto-rejects unresolved approvals older than `ttl_ms` and
    /// returns them.
    pub fn expire_unresolved(&self, ttl_ms: u64, now: DateTime<Utc>) -> Result<Vec<PendingApproval>> {
        let stale: Vec<EnvelopeId> = self
            .list_unresolved()?
            .into_iter()
            .filter(|a| now.signed_duration_since(a.created_at).num_milliseconds() > ttl_ms as i64)
            .map(|a| a.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            expired.push(self.resolve(&id, false, Some("approval timed out".into()))?);
        }
        Ok(expired)
    }

    /// Deletes resolved approvals older than `retention_ms`. Returns
    /// the number purged.
    pub fn purge_resolved(&self, retention_ms: u64, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.guard()?;

        let mut purged = 0;
        for path in atomic::list_documents(&self.dir)? {
            let approval: PendingApproval = atomic::read_json(&path)?;
            let Some(resolved_at) = approval.resolved_at else {
                continue;
            };
            if now.signed_duration_since(resolved_at).num_milliseconds() > retention_ms as i64 {
                atomic::remove(&path)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    // -- Internal ---------------------------------------------------------

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|e| Ai2AiError::Storage {
            reason: format!("approval store lock poisoned: {e}"),
        })
    }

    fn path(&self, id: &EnvelopeId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn load(&self, id: &EnvelopeId) -> Result<Option<PendingApproval>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        atomic::read_json(&path).map(Some)
    }

    fn save(&self, approval: &PendingApproval) -> Result<()> {
        atomic::write_json(&self.path(&approval.id), approval)
    }

    fn list_all(&self) -> Result<Vec<PendingApproval>> {
        let _guard = self.guard()?;
        let mut approvals = Vec::new();
        for path in atomic::list_documents(&self.dir)? {
            approvals.push(atomic::read_json(&path)?);
        }
        Ok(approvals)
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
    use serde_json::json;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"))
    }

    fn request() -> Envelope {
        EnvelopeBuilder::new(
            Party {
                agent: AgentId::new("alice.example"),
                human: "Alice".into(),
            },
            AgentId::new("bob.example"),
            ConversationId::generate(),
            EnvelopeType::Request,
        )
        .intent("commerce.request")
        .payload(json!({"item": "Widget", "budget": "500 GBP"}))
        .build()
    }

    #[test]
    fn enqueue_and_get() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;
        let envelope = request();
        let id = envelope.id;

        store.enqueue(envelope, "purchase request".into())?;

        let approval = store.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "approval missing".into(),
        })?;
        assert!(!approval.resolved);
        assert_eq!(approval.approval_text, "purchase request");
        Ok(())
    }

    #[test]
    fn enqueue_same_envelope_once() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;
        let envelope = request();

        store.enqueue(envelope.clone(), "first".into())?;
        let second = store.enqueue(envelope, "second".into())?;

        // The original record wins.
        assert_eq!(second.approval_text, "first");
        assert_eq!(store.list_unresolved()?.len(), 1);
        Ok(())
    }

    #[test]
    fn resolve_approve_with_reply() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;
        let envelope = request();
        let id = envelope.id;
        store.enqueue(envelope, "review".into())?;

        let resolved = store.resolve(&id, true, Some("2".into()))?;
        assert!(resolved.resolved);
        assert_eq!(resolved.approved, Some(true));
        assert_eq!(resolved.human_reply.as_deref(), Some("2"));
        assert!(resolved.resolved_at.is_some());
        Ok(())
    }

    #[test]
    fn double_resolve_fails() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;
        let envelope = request();
        let id = envelope.id;
        store.enqueue(envelope, "review".into())?;

        store.resolve(&id, true, None)?;
        let result = store.resolve(&id, false, None);
        assert!(matches!(result, Err(Ai2AiError::InvalidTransition { .. })));
        Ok(())
    }

    #[test]
    fn unresolved_listed_oldest_first() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;

        let first = request();
        let first_id = first.id;
        store.enqueue(first, "one".into())?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.enqueue(request(), "two".into())?;

        let pending = store.list_unresolved()?;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first_id);
        Ok(())
    }

    #[test]
    fn expire_unresolved_auto_rejects() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;
        let envelope = request();
        let id = envelope.id;
        store.enqueue(envelope, "stale".into())?;

        let later = Utc::now() + chrono::Duration::hours(25);
        let expired = store.expire_unresolved(86_400_000, later)?;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].approved, Some(false));
        assert!(store.list_unresolved()?.is_empty());

        let record = store.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "approval missing".into(),
        })?;
        assert!(record.resolved);
        Ok(())
    }

    #[test]
    fn purge_removes_old_resolved_only() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ApprovalStore::open(dir.path())?;

        let resolved = request();
        let resolved_id = resolved.id;
        store.enqueue(resolved, "done".into())?;
        store.resolve(&resolved_id, true, None)?;

        let open = request();
        let open_id = open.id;
        store.enqueue(open, "open".into())?;

        let later = Utc::now() + chrono::Duration::days(8);
        let purged = store.purge_resolved(7 * 86_400_000, later)?;

        assert_eq!(purged, 1);
        assert!(store.get(&resolved_id)?.is_none());
        assert!(store.get(&open_id)?.is_some());
        Ok(())
    }

    #[test]
    fn survives_reopen() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let envelope = request();
        let id = envelope.id;
        {
            let store = ApprovalStore::open(dir.path())?;
            store.enqueue(envelope, "durable".into())?;
        }

        let store = ApprovalStore::open(dir.path())?;
        assert!(store.get(&id)?.is_some());
        Ok(())
    }
}
