//! Intent handler registry.
//!
//! Business logic lives outside the node: callers register an
//! [`IntentHandler`] per namespaced intent, and the node routes
//! inbound `request` envelopes to it. A handler returns a tagged
//! [`HandlerOutcome`] — the node alone decides which envelope type
//! carries the answer back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ai2ai_protocol::envelope::Envelope;
use serde_json::Value;

// ---------------------------------------------------------------------------
// IntentRequest / HandlerOutcome
// ---------------------------------------------------------------------------

/// Everything a handler sees about an inbound request.
pub struct IntentRequest {
    /// The verified envelope (payload already decrypted).
    pub envelope: Envelope,
    /// Decrypted request payload.
    pub payload: Value,
    /// The operator's free-text reply, present only on the approval
    /// path.
    pub reply: Option<String>,
}

/// Tagged handler result; the node maps it to an envelope type.
pub enum HandlerOutcome {
    /// Accept: answered with a `response` envelope.
    Approved(Value),
    /// Decline: answered with a `reject` envelope.
    Rejected(String),
    /// Counter-proposal: answered with a `response` envelope, keeping
    /// the conversation in negotiation.
    Counter(Value),
}

// ---------------------------------------------------------------------------
// IntentHandler
// ---------------------------------------------------------------------------

/// One registered intent.
pub trait IntentHandler: Send + Sync {
    /// Produces the outcome for a request.
    ///
    /// Called on the auto-dispatch path with `request.reply == None`,
    /// and on the approval path with the operator's reply filled in.
    fn handle(&self, request: &IntentRequest) -> HandlerOutcome;

    /// Summary shown to the operator when the request needs approval.
    fn approval_text(&self, request: &IntentRequest) -> String {
        format!(
            "{} asks {}: {}",
            request.envelope.from.agent,
            request.envelope.intent.as_deref().unwrap_or("(no intent)"),
            request.payload,
        )
    }

    /// `true` forces the approval path regardless of trust level.
    fn requires_approval(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// IntentRegistry
// ---------------------------------------------------------------------------

/// Thread-safe intent → handler map.
#[derive(Default)]
pub struct IntentRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn IntentHandler>>>,
}

impl IntentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `intent`, replacing any previous one.
    pub fn register(&self, intent: impl Into<String>, handler: Arc<dyn IntentHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(intent.into(), handler);
        }
    }

    /// Returns the handler for `intent`.
    pub fn get(&self, intent: &str) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.read().ok()?.get(intent).cloned()
    }

    /// Sorted list of registered intent names; advertised in the
    /// health response and discovery descriptor.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
