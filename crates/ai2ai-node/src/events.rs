//! Node events and callback registration.
//!
//! Event emission is a typed callback fan-out on the node value:
//! consumers register listeners with [`EventBus::subscribe`] and
//! match on the [`NodeEvent`] enum. Listeners run inline on the
//! emitting task, so they must stay cheap — adapters that need to do
//! real work should forward into their own channel.

use std::sync::RwLock;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{AgentId, ConversationId, ConversationState, EnvelopeId, ReceiptStatus};
use serde_json::Value;

// ---------------------------------------------------------------------------
// NodeEvent
// ---------------------------------------------------------------------------

/// Everything observable about a running node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A one-way `message` or `inform` envelope arrived and passed
    /// every filter.
    Message {
        envelope: Envelope,
        /// Decrypted payload when encryption applied.
        payload: Value,
    },
    /// A `request` envelope was dispatched to its intent handler
    /// (trust allowed it to bypass approval).
    Request {
        envelope: Envelope,
        payload: Value,
    },
    /// A delivery `receipt` arrived from a peer.
    Receipt {
        message_id: EnvelopeId,
        status: ReceiptStatus,
        from: AgentId,
    },
    /// An outbound envelope was handed to the delivery engine.
    Sent { id: EnvelopeId, to: AgentId },
    /// The recipient's endpoint acknowledged the envelope with 2xx.
    Delivered { id: EnvelopeId, to: AgentId },
    /// The recipient reported the envelope read.
    Read { id: EnvelopeId },
    /// All delivery attempts were exhausted.
    Failed {
        id: EnvelopeId,
        to: AgentId,
        error: String,
    },
    /// A circuit breaker opened for an endpoint.
    CircuitOpen { endpoint: String },
    /// A circuit breaker closed again after a successful probe.
    CircuitClosed { endpoint: String },
    /// An inbound request is waiting for operator action.
    ApprovalRequested {
        approval_id: EnvelopeId,
        from: AgentId,
        approval_text: String,
    },
    /// A pending approval passed its TTL and was auto-rejected.
    ApprovalExpired { approval_id: EnvelopeId },
    /// A conversation reached a terminal state; emitted exactly once
    /// per terminal transition.
    Notification {
        conversation: ConversationId,
        state: ConversationState,
        from: AgentId,
    },
}

impl NodeEvent {
    /// Short event name, matching the protocol's event vocabulary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Request { .. } => "request",
            Self::Receipt { .. } => "receipt",
            Self::Sent { .. } => "sent",
            Self::Delivered { .. } => "delivered",
            Self::Read { .. } => "read",
            Self::Failed { .. } => "failed",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::CircuitClosed { .. } => "circuit-closed",
            Self::ApprovalRequested { .. } => "approval-requested",
            Self::ApprovalExpired { .. } => "approval-expired",
            Self::Notification { .. } => "notification",
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Listener callback type.
pub type Listener = Box<dyn Fn(&NodeEvent) + Send + Sync>;

/// Fan-out of node events to registered listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for all events.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Box::new(listener));
        }
    }

    /// Delivers an event to every listener.
    pub fn emit(&self, event: &NodeEvent) {
        tracing::debug!(kind = event.kind(), "node event");
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(&NodeEvent::Read {
            id: EnvelopeId::generate(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let bus = EventBus::new();
        bus.emit(&NodeEvent::CircuitOpen {
            endpoint: "http://peer/ai2ai".into(),
        });
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn kind_names_match_protocol() {
        let event = NodeEvent::CircuitOpen {
            endpoint: "e".into(),
        };
        assert_eq!(event.kind(), "circuit-open");

        let event = NodeEvent::ApprovalExpired {
            approval_id: EnvelopeId::generate(),
        };
        assert_eq!(event.kind(), "approval-expired");
    }
}
