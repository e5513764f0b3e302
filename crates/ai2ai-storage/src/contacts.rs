//! Contact registry and blocklist.
//!
//! `contacts.json` holds the full peer map and is atomically replaced
//! on every mutation; `blocklist.json` is a flat list of blocked
//! agent ids kept separate so the hot blocklist check never parses
//! the whole contact map. Both load on open and are served from
//! memory afterwards.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use ai2ai_types::{Ai2AiError, AgentId, Result, TrustLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A peer record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Contact {
    /// Operator display name, if known.
    #[serde(default)]
    pub human_name: Option<String>,
    /// HTTP endpoint for delivery, e.g. `http://host:18800/ai2ai`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Current Ed25519 public key, lowercase hex.
    #[serde(default)]
    pub ed_public_key: Option<String>,
    /// X25519 key-agreement public key, lowercase hex.
    #[serde(default)]
    pub x_public_key: Option<String>,
    /// Operator-assigned trust level.
    #[serde(default)]
    pub trust_level: TrustLevel,
    /// Intents this peer advertises.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// IANA timezone name, if advertised.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Last time any envelope or handshake from this peer was seen.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Previous Ed25519 public keys still accepted during rotation
    /// grace, newest first.
    #[serde(default)]
    pub previous_ed_keys: Vec<String>,
}

/// Patch applied by [`ContactRegistry::upsert`]; `None` fields are
/// left untouched.
#[derive(Clone, Debug, Default)]
pub struct ContactUpdate {
    pub human_name: Option<String>,
    pub endpoint: Option<String>,
    pub ed_public_key: Option<String>,
    pub x_public_key: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// ContactRegistry
// ---------------------------------------------------------------------------

/// Disk-backed contact map plus blocklist.
///
/// Mutations hold the internal lock for the duration of the disk
/// write, serializing writers; readers get cloned snapshots.
pub struct ContactRegistry {
    contacts_path: PathBuf,
    blocklist_path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    contacts: HashMap<AgentId, Contact>,
    blocked: HashSet<AgentId>,
}

impl ContactRegistry {
    /// Opens the registry rooted at `data_dir`, loading any existing
    /// state.
    pub fn open(data_dir: &std::path::Path) -> Result<Self> {
        let contacts_path = data_dir.join("contacts.json");
        let blocklist_path = data_dir.join("blocklist.json");

        let contacts: HashMap<AgentId, Contact> =
            atomic::read_json_or(&contacts_path, HashMap::new)?;
        let blocked_list: Vec<AgentId> = atomic::read_json_or(&blocklist_path, Vec::new)?;

        Ok(Self {
            contacts_path,
            blocklist_path,
            inner: Mutex::new(Inner {
                contacts,
                blocked: blocked_list.into_iter().collect(),
            }),
        })
    }

    /// Merges `update` into the record for `agent_id`, creating it if
    /// absent, and stamps `last_seen`.
    pub fn upsert(&self, agent_id: &AgentId, update: ContactUpdate) -> Result<()> {
        let mut inner = self.lock()?;
        {
            let contact = inner.contacts.entry(agent_id.clone()).or_default();

            if let Some(human_name) = update.human_name {
                contact.human_name = Some(human_name);
            }
            if let Some(endpoint) = update.endpoint {
                contact.endpoint = Some(endpoint);
            }
            if let Some(ed_key) = update.ed_public_key {
                // A changed signing key archives the old one for the
                // rotation grace period.
                if let Some(previous) = contact.ed_public_key.take() {
                    if previous != ed_key && !contact.previous_ed_keys.contains(&previous) {
                        contact.previous_ed_keys.insert(0, previous);
                        contact.previous_ed_keys.truncate(3);
                    }
                }
                contact.ed_public_key = Some(ed_key);
            }
            if let Some(x_key) = update.x_public_key {
                contact.x_public_key = Some(x_key);
            }
            if let Some(capabilities) = update.capabilities {
                contact.capabilities = capabilities;
            }
            if let Some(timezone) = update.timezone {
                contact.timezone = Some(timezone);
            }
            contact.last_seen = Some(Utc::now());
        }
        self.persist_contacts(&inner)
    }

    /// Stamps `last_seen` without changing anything else.
    pub fn touch(&self, agent_id: &AgentId) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(contact) = inner.contacts.get_mut(agent_id) {
            contact.last_seen = Some(Utc::now());
            self.persist_contacts(&inner)?;
        }
        Ok(())
    }

    /// Returns a snapshot of the record for `agent_id`.
    pub fn get(&self, agent_id: &AgentId) -> Result<Option<Contact>> {
        Ok(self.lock()?.contacts.get(agent_id).cloned())
    }

    /// Returns all contacts as `(id, record)` snapshots.
    pub fn list(&self) -> Result<Vec<(AgentId, Contact)>> {
        Ok(self
            .lock()?
            .contacts
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect())
    }

    /// Sets the operator-assigned trust level.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Resolution`] for an unknown contact.
    pub fn set_trust(&self, agent_id: &AgentId, level: TrustLevel) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.contacts.get_mut(agent_id) {
            Some(contact) => {
                contact.trust_level = level;
            }
            None => {
                return Err(Ai2AiError::Resolution {
                    reason: format!("unknown contact {agent_id}"),
                })
            }
        }
        self.persist_contacts(&inner)
    }

    /// Adds `agent_id` to the blocklist.
    pub fn block(&self, agent_id: &AgentId) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.blocked.insert(agent_id.clone()) {
            self.persist_blocklist(&inner)?;
        }
        Ok(())
    }

    /// Removes `agent_id` from the blocklist.
    pub fn unblock(&self, agent_id: &AgentId) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.blocked.remove(agent_id) {
            self.persist_blocklist(&inner)?;
        }
        Ok(())
    }

    /// `true` when `agent_id` is blocked.
    pub fn is_blocked(&self, agent_id: &AgentId) -> Result<bool> {
        Ok(self.lock()?.blocked.contains(agent_id))
    }

    /// The signature-verification candidates for a peer: current key
    /// first, then archived rotation keys. Empty when no key is known
    /// (first contact).
    pub fn verification_keys(&self, agent_id: &AgentId) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let Some(contact) = inner.contacts.get(agent_id) else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::with_capacity(1 + contact.previous_ed_keys.len());
        if let Some(current) = &contact.ed_public_key {
            keys.push(current.clone());
        }
        keys.extend(contact.previous_ed_keys.iter().cloned());
        Ok(keys)
    }

    // -- Internal ---------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| Ai2AiError::Storage {
            reason: format!("contact registry lock poisoned: {e}"),
        })
    }

    fn persist_contacts(&self, inner: &Inner) -> Result<()> {
        atomic::write_json(&self.contacts_path, &inner.contacts)
    }

    fn persist_blocklist(&self, inner: &Inner) -> Result<()> {
        let mut list: Vec<&AgentId> = inner.blocked.iter().collect();
        list.sort();
        atomic::write_json(&self.blocklist_path, &list)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
