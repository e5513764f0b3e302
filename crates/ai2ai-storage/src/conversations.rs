//! Conversation metadata, state machine, and append logs.
//!
//! Each conversation owns two files under `conversations/`:
//!
//! ```text
//! <id>.meta.json   metadata + state (atomically replaced)
//! <id>.jsonl       append-only envelope log, one JSON per line
//! ```
//!
//! The state machine:
//!
//! ```text
//! proposed ──▶ negotiating ──▶ confirmed
//!    │              │      └─▶ rejected
//!    │              └─────────▶ expired
//!    └─▶ confirmed | rejected | expired
//! ```
//!
//! Terminal states absorb everything; an invalid transition returns
//! an error and never mutates state.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{
    Ai2AiError, AgentId, ConversationId, ConversationState, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;

// ---------------------------------------------------------------------------
// ConversationMeta
// ---------------------------------------------------------------------------

/// Persisted conversation metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Current state machine position.
    pub state: ConversationState,
    /// The intent that opened the conversation, if any.
    pub intent: Option<String>,
    /// Agent that sent the first envelope.
    pub initiator: AgentId,
    /// The other party of a two-sided exchange.
    pub recipient: AgentId,
    /// All participating agents (fan-out conversations list every
    /// recipient here).
    pub participants: Vec<AgentId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity time; drives expiry.
    pub updated_at: DateTime<Utc>,
    /// Optional explicit expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Envelopes appended to the log so far.
    pub message_count: u64,
}

/// Checks the transition table.
fn transition_allowed(from: ConversationState, to: ConversationState) -> bool {
    use ConversationState::{Confirmed, Expired, Negotiating, Proposed, Rejected};
    matches!(
        (from, to),
        (Proposed, Negotiating | Confirmed | Rejected | Expired)
            | (Negotiating, Confirmed | Rejected | Expired)
    )
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

/// Disk-backed conversation store.
///
/// The lock serializes metadata read-modify-write cycles and log
/// appends; per-conversation granularity is not worth the complexity
/// at node message rates.
pub struct ConversationStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

/// Arguments for [`ConversationStore::create`].
pub struct NewConversation {
    pub intent: Option<String>,
    pub initiator: AgentId,
    pub recipient: AgentId,
    pub participants: Vec<AgentId>,
}

impl ConversationStore {
    /// Opens the store rooted at `<data_dir>/conversations/`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("conversations");
        std::fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Creates conversation metadata in state `proposed`.
    ///
    /// Creating an id that already exists is a no-op returning the
    /// existing metadata — inbound and outbound paths may race to
    /// register the same conversation.
    pub fn create(&self, id: ConversationId, new: NewConversation) -> Result<ConversationMeta> {
        let _guard = self.guard()?;

        if let Some(existing) = self.load_meta(&id)? {
            return Ok(existing);
        }

        let now = Utc::now();
        let meta = ConversationMeta {
            id,
            state: ConversationState::Proposed,
            intent: new.intent,
            initiator: new.initiator,
            recipient: new.recipient,
            participants: new.participants,
            created_at: now,
            updated_at: now,
            expires_at: None,
            message_count: 0,
        };
        self.save_meta(&meta)?;
        Ok(meta)
    }

    /// Returns metadata for `id`, if the conversation exists.
    pub fn get(&self, id: &ConversationId) -> Result<Option<ConversationMeta>> {
        let _guard = self.guard()?;
        self.load_meta(id)
    }

    /// Lists every conversation's metadata.
    pub fn list(&self) -> Result<Vec<ConversationMeta>> {
        let _guard = self.guard()?;
        let mut metas = Vec::new();
        for path in atomic::list_documents(&self.dir)? {
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if is_meta {
                metas.push(atomic::read_json(&path)?);
            }
        }
        Ok(metas)
    }

    /// Moves a conversation to `new_state`.
    ///
    /// # Errors
    ///
    /// - [`Ai2AiError::Resolution`] for an unknown conversation.
    /// - [`Ai2AiError::InvalidTransition`] for a move the table
    ///   forbids; state is untouched.
    pub fn transition(
        &self,
        id: &ConversationId,
        new_state: ConversationState,
    ) -> Result<ConversationMeta> {
        let _guard = self.guard()?;

        let mut meta = self.load_meta(id)?.ok_or_else(|| Ai2AiError::Resolution {
            reason: format!("unknown conversation {id}"),
        })?;

        if meta.state == new_state {
            // Idempotent: re-applying the current state is how
            // cross-node convergence works.
            return Ok(meta);
        }

        if !transition_allowed(meta.state, new_state) {
            return Err(Ai2AiError::InvalidTransition {
                reason: format!("conversation {id}: {} -> {new_state} is not allowed", meta.state),
            });
        }

        meta.state = new_state;
        meta.updated_at = Utc::now();
        self.save_meta(&meta)?;
        Ok(meta)
    }

    /// Appends an envelope to the conversation's `.jsonl` log and
    /// bumps `message_count` / `updated_at`.
    ///
    /// The conversation is implicitly created in state `proposed`
    /// when no metadata exists yet.
    pub fn append_envelope(&self, envelope: &Envelope) -> Result<()> {
        let _guard = self.guard()?;

        let id = envelope.conversation;
        let mut meta = match self.load_meta(&id)? {
            Some(meta) => meta,
            None => {
                let now = Utc::now();
                ConversationMeta {
                    id,
                    state: ConversationState::Proposed,
                    intent: envelope.intent.clone(),
                    initiator: envelope.from.agent.clone(),
                    recipient: envelope.to.agent.clone(),
                    participants: vec![envelope.from.agent.clone(), envelope.to.agent.clone()],
                    created_at: now,
                    updated_at: now,
                    expires_at: None,
                    message_count: 0,
                }
            }
        };

        let line = serde_json::to_string(envelope).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to serialize envelope for log: {e}"),
        })?;
        let log_path = self.dir.join(format!("{id}.jsonl"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Ai2AiError::Storage {
                reason: format!("failed to open {}: {e}", log_path.display()),
            })?;
        writeln!(file, "{line}").map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to append to {}: {e}", log_path.display()),
        })?;

        meta.message_count += 1;
        meta.updated_at = Utc::now();
        self.save_meta(&meta)
    }

    /// Reads the full envelope log for a conversation.
    pub fn read_log(&self, id: &ConversationId) -> Result<Vec<Envelope>> {
        let _guard = self.guard()?;

        let log_path = self.dir.join(format!("{id}.jsonl"));
        if !log_path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&log_path).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to read {}: {e}", log_path.display()),
        })?;

        let mut envelopes = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            envelopes.push(serde_json::from_str(line).map_err(|e| Ai2AiError::Storage {
                reason: format!("corrupt log line in {}: {e}", log_path.display()),
            })?);
        }
        Ok(envelopes)
    }

    /// Expires every non-terminal conversation whose last activity is
    /// older than `expiry_ms`. Returns the ids that changed state.
    pub fn expire_stale(&self, expiry_ms: u64, now: DateTime<Utc>) -> Result<Vec<ConversationId>> {
        let stale: Vec<ConversationId> = self
            .list()?
            .into_iter()
            .filter(|meta| {
                if meta.state.is_terminal() {
                    return false;
                }
                let explicit_expired = meta.expires_at.is_some_and(|at| now >= at);
                let idle_ms = now.signed_duration_since(meta.updated_at).num_milliseconds();
                explicit_expired || idle_ms > expiry_ms as i64
            })
            .map(|meta| meta.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            self.transition(&id, ConversationState::Expired)?;
            expired.push(id);
        }
        Ok(expired)
    }

    // -- Internal ---------------------------------------------------------

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|e| Ai2AiError::Storage {
            reason: format!("conversation store lock poisoned: {e}"),
        })
    }

    fn meta_path(&self, id: &ConversationId) -> PathBuf {
        self.dir.join(format!("{id}.meta.json"))
    }

    fn load_meta(&self, id: &ConversationId) -> Result<Option<ConversationMeta>> {
        let path = self.meta_path(id);
        if !path.exists() {
            return Ok(None);
        }
        atomic::read_json(&path).map(Some)
    }

    fn save_meta(&self, meta: &ConversationMeta) -> Result<()> {
        atomic::write_json(&self.meta_path(&meta.id), meta)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ai2ai_protocol::envelope::{EnvelopeBuilder, Party};
    use ai2ai_types::EnvelopeType;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"))
    }

    fn new_conversation() -> NewConversation {
        NewConversation {
            intent: Some("schedule.meeting".into()),
            initiator: AgentId::new("alice.example"),
            recipient: AgentId::new("bob.example"),
            participants: vec![AgentId::new("alice.example"), AgentId::new("bob.example")],
        }
    }

    fn test_envelope(conversation: ConversationId) -> Envelope {
        EnvelopeBuilder::new(
            Party {
                agent: AgentId::new("alice.example"),
                human: "Alice".into(),
            },
            AgentId::new("bob.example"),
            conversation,
            EnvelopeType::Request,
        )
        .intent("schedule.meeting")
        .build()
    }

    #[test]
    fn create_starts_proposed() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();

        let meta = store.create(id, new_conversation())?;
        assert_eq!(meta.state, ConversationState::Proposed);
        assert_eq!(meta.message_count, 0);
        Ok(())
    }

    #[test]
    fn create_is_idempotent() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();

        store.create(id, new_conversation())?;
        store.transition(&id, ConversationState::Negotiating)?;

        // Re-creating returns the existing record, state intact.
        let meta = store.create(id, new_conversation())?;
        assert_eq!(meta.state, ConversationState::Negotiating);
        Ok(())
    }

    #[test]
    fn legal_transition_chain() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();
        store.create(id, new_conversation())?;

        store.transition(&id, ConversationState::Negotiating)?;
        let meta = store.transition(&id, ConversationState::Confirmed)?;
        assert_eq!(meta.state, ConversationState::Confirmed);
        Ok(())
    }

    #[test]
    fn terminal_state_absorbs() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();
        store.create(id, new_conversation())?;
        store.transition(&id, ConversationState::Rejected)?;

        // Any move out of a terminal state fails without mutating.
        let result = store.transition(&id, ConversationState::Confirmed);
        assert!(matches!(result, Err(Ai2AiError::InvalidTransition { .. })));

        let meta = store.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "meta missing".into(),
        })?;
        assert_eq!(meta.state, ConversationState::Rejected);
        Ok(())
    }

    #[test]
    fn reapplying_current_state_is_idempotent() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();
        store.create(id, new_conversation())?;
        store.transition(&id, ConversationState::Confirmed)?;

        let meta = store.transition(&id, ConversationState::Confirmed)?;
        assert_eq!(meta.state, ConversationState::Confirmed);
        Ok(())
    }

    #[test]
    fn unknown_conversation_transition_fails() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let result = store.transition(&ConversationId::generate(), ConversationState::Confirmed);
        assert!(matches!(result, Err(Ai2AiError::Resolution { .. })));
        Ok(())
    }

    #[test]
    fn append_creates_and_counts() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;
        let id = ConversationId::generate();

        store.append_envelope(&test_envelope(id))?;
        store.append_envelope(&test_envelope(id))?;

        let meta = store.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "meta missing".into(),
        })?;
        assert_eq!(meta.message_count, 2);

        let log = store.read_log(&id)?;
        assert_eq!(log.len(), 2);
        Ok(())
    }

    #[test]
    fn expire_stale_skips_terminal_and_fresh() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let store = ConversationStore::open(dir.path())?;

        let fresh = ConversationId::generate();
        store.create(fresh, new_conversation())?;

        let done = ConversationId::generate();
        store.create(done, new_conversation())?;
        store.transition(&done, ConversationState::Confirmed)?;

        // A sweep "7 days from now" only catches the fresh-but-idle one.
        let future = Utc::now() + chrono::Duration::days(8);
        let expired = store.expire_stale(7 * 86_400_000, future)?;

        assert_eq!(expired, vec![fresh]);
        let meta = store.get(&done)?.ok_or(Ai2AiError::Internal {
            reason: "meta missing".into(),
        })?;
        assert_eq!(meta.state, ConversationState::Confirmed);
        Ok(())
    }

    #[test]
    fn state_survives_reopen() -> std::result::Result<(), Ai2AiError> {
        let dir = tmp();
        let id = ConversationId::generate();
        {
            let store = ConversationStore::open(dir.path())?;
            store.create(id, new_conversation())?;
            store.transition(&id, ConversationState::Negotiating)?;
            store.append_envelope(&test_envelope(id))?;
        }

        let store = ConversationStore::open(dir.path())?;
        let meta = store.get(&id)?.ok_or(Ai2AiError::Internal {
            reason: "meta missing".into(),
        })?;
        assert_eq!(meta.state, ConversationState::Negotiating);
        assert_eq!(meta.message_count, 1);
        assert_eq!(store.read_log(&id)?.len(), 1);
        Ok(())
    }
}
