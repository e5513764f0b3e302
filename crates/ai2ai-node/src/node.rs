//! Node lifecycle and public API.
//!
//! The [`Node`] is the entry point for the ai2ai runtime. It owns
//! every subsystem — keys, contacts, conversations, approvals, queue,
//! dead letters, caches, delivery engine — and exposes the operator
//! surface: send/request/ping, contact and trust management, approval
//! resolution, and typed event callbacks.
//!
//! # Lifecycle
//!
//! ```text
//! Node::new ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! `stop()` is a drain: the HTTP listener closes, background workers
//! finish their current tick, and pending queue entries stay on disk
//! for the next run. Multiple nodes in one process are permitted only
//! with disjoint data directories.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use ai2ai_keys::KeyStore;
use ai2ai_protocol::dedup::DedupCache;
use ai2ai_protocol::envelope::{Envelope, Party};
use ai2ai_protocol::nonce::ReplayGuard;
use ai2ai_storage::approvals::ApprovalStore;
use ai2ai_storage::contacts::{Contact, ContactRegistry, ContactUpdate};
use ai2ai_storage::conversations::ConversationStore;
use ai2ai_storage::dlq::DeadLetterStore;
use ai2ai_storage::queue::DeliveryQueue;
use ai2ai_types::config::NodeConfig;
use ai2ai_types::{
    Ai2AiError, AgentId, ConversationId, ConversationState, EnvelopeId, EnvelopeType, Result,
    TrustLevel,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activity_log::ActivityLog;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::delivery::{DeliveryEngine, RetryConfig};
use crate::discovery::{DiscoveryClient, RegistryAgent};
use crate::egress::{SendOptions, SendOutcome};
use crate::events::{EventBus, NodeEvent};
use crate::intents::{HandlerOutcome, IntentHandler, IntentRegistry, IntentRequest};
use crate::rate_limiter::RateLimiter;
use crate::tracker::DeliveryTracker;
use crate::verify_cache::VerifyCache;
use crate::{ingress, maintenance, queue_worker};

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Subsystems created, HTTP server not yet bound.
    Created,
    /// Server bound, workers running.
    Running,
    /// Drained and stopped.
    Stopped,
}

// ---------------------------------------------------------------------------
// NodeInner
// ---------------------------------------------------------------------------

/// Shared runtime state; everything the pipelines touch.
pub struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) keys: RwLock<KeyStore>,
    pub(crate) contacts: ContactRegistry,
    pub(crate) conversations: ConversationStore,
    pub(crate) approvals: ApprovalStore,
    pub(crate) queue: DeliveryQueue,
    pub(crate) dlq: DeadLetterStore,
    pub(crate) delivery: DeliveryEngine,
    pub(crate) discovery: DiscoveryClient,
    pub(crate) intents: IntentRegistry,
    pub(crate) events: Arc<EventBus>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) replay_guard: Mutex<ReplayGuard>,
    pub(crate) dedup: Mutex<DedupCache>,
    pub(crate) verify_cache: Mutex<VerifyCache>,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) activity: ActivityLog,
}

impl NodeInner {
    /// `from` identity for outbound envelopes.
    pub(crate) fn our_party(&self) -> Party {
        Party {
            agent: AgentId::new(self.config.name.clone()),
            human: self.config.human_name.clone(),
        }
    }

    /// Our agent id.
    pub(crate) fn agent_id(&self) -> AgentId {
        AgentId::new(self.config.name.clone())
    }

    /// Fingerprint of the current signing key.
    pub(crate) fn fingerprint(&self) -> String {
        self.keys
            .read()
            .map(|keys| keys.fingerprint())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The ai2ai node runtime.
pub struct Node {
    inner: Arc<NodeInner>,
    state: NodeState,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

impl Node {
    /// Creates a node: opens (or initializes) every disk-backed store
    /// under `config.data_dir` and wires the subsystems together.
    ///
    /// # Errors
    ///
    /// - [`Ai2AiError::Config`] for an invalid configuration.
    /// - [`Ai2AiError::Storage`] when a store cannot be opened.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let keys = KeyStore::open(&config.data_dir)?;
        let contacts = ContactRegistry::open(&config.data_dir)?;
        let conversations = ConversationStore::open(&config.data_dir)?;
        let approvals = ApprovalStore::open(&config.data_dir)?;
        let queue = DeliveryQueue::open(&config.data_dir)?;
        let dlq = DeadLetterStore::open(&config.data_dir)?;
        let activity = ActivityLog::open(&config.data_dir)?;

        let delivery = DeliveryEngine::new(
            config.timeout(),
            RetryConfig::default(),
            BreakerRegistry::new(BreakerConfig::default()),
            Arc::clone(&events),
        )?;
        let discovery = DiscoveryClient::new(config.registry.clone())?;

        let rate_limiter = RateLimiter::per_minute(config.rate_limit_per_min);

        tracing::info!(
            agent = %config.name,
            fingerprint = %keys.fingerprint(),
            data_dir = %config.data_dir.display(),
            "node initialized"
        );

        let inner = Arc::new(NodeInner {
            config,
            keys: RwLock::new(keys),
            contacts,
            conversations,
            approvals,
            queue,
            dlq,
            delivery,
            discovery,
            intents: IntentRegistry::new(),
            events,
            rate_limiter,
            replay_guard: Mutex::new(ReplayGuard::with_default_retention()),
            dedup: Mutex::new(DedupCache::with_defaults()),
            verify_cache: Mutex::new(VerifyCache::with_defaults()),
            tracker: DeliveryTracker::new(),
            activity,
        });

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner,
            state: NodeState::Created,
            shutdown_tx,
            handles: Vec::new(),
            bound_addr: None,
        })
    }

    /// Binds the HTTP server and spawns the background workers.
    ///
    /// Pass `port` 0 to let the OS pick (tests); the chosen address
    /// is returned.
    ///
    /// # Errors
    ///
    /// - [`Ai2AiError::Config`] when already running.
    /// - [`Ai2AiError::Transport`] when the port cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != NodeState::Created {
            return Err(Ai2AiError::Config {
                reason: format!("cannot start a node in state {:?}", self.state),
            });
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.inner.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("failed to bind {addr}: {e}"),
            })?;
        let bound = listener.local_addr().map_err(|e| Ai2AiError::Transport {
            reason: format!("failed to read bound address: {e}"),
        })?;

        let router = ingress::router(Arc::clone(&self.inner));
        let mut server_shutdown = self.shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown.changed().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "HTTP server exited with error");
            }
        });
        self.handles.push(server);

        let worker = tokio::spawn(queue_worker::run(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        ));
        self.handles.push(worker);

        let sweeper = tokio::spawn(maintenance::run(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        ));
        self.handles.push(sweeper);

        // Registry presence: register once, then heartbeat faster
        // than the registry's 2-minute staleness window.
        if self.inner.config.registry.is_some() {
            let heartbeat = tokio::spawn(registry_presence(
                Arc::clone(&self.inner),
                self.shutdown_tx.subscribe(),
            ));
            self.handles.push(heartbeat);
        }

        self.state = NodeState::Running;
        self.bound_addr = Some(bound);
        tracing::info!(addr = %bound, agent = %self.inner.config.name, "node listening");
        Ok(bound)
    }

    /// Drains and stops: closes the listener, finishes in-flight
    /// work, cancels timers. Pending queue entries survive on disk.
    pub async fn stop(&mut self) {
        if self.state != NodeState::Running {
            return;
        }
        self.state = NodeState::Stopped;

        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(agent = %self.inner.config.name, "node stopped");
    }

    // -- Identity ---------------------------------------------------------

    /// This node's agent id.
    pub fn agent_id(&self) -> AgentId {
        self.inner.agent_id()
    }

    /// Fingerprint of the current signing key.
    pub fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }

    /// The bound HTTP address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    // -- Events and intents -----------------------------------------------

    /// Registers an event listener.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener);
    }

    /// Registers an intent handler.
    pub fn register_intent(&self, intent: impl Into<String>, handler: Arc<dyn IntentHandler>) {
        self.inner.intents.register(intent, handler);
    }

    // -- Messaging --------------------------------------------------------

    /// Sends a one-way `message` envelope.
    pub async fn send(
        &self,
        target: &AgentId,
        message: &str,
        opts: SendOptions,
    ) -> Result<SendOutcome> {
        crate::egress::send_typed(
            &self.inner,
            target,
            EnvelopeType::Message,
            None,
            json!({ "message": message }),
            opts,
        )
        .await
    }

    /// Sends a `request` envelope addressed to `intent`.
    ///
    /// Returns the transport acknowledgement only — the semantic
    /// reply arrives later as a `response` envelope in the same
    /// conversation.
    pub async fn request(
        &self,
        target: &AgentId,
        intent: &str,
        payload: Value,
        opts: SendOptions,
    ) -> Result<SendOutcome> {
        crate::egress::send_typed(
            &self.inner,
            target,
            EnvelopeType::Request,
            Some(intent.to_owned()),
            payload,
            opts,
        )
        .await
    }

    /// Pings a peer: exchanges capabilities and public keys, learning
    /// the peer's identity into the contact registry.
    pub async fn ping(&self, target: &AgentId) -> Result<SendOutcome> {
        crate::egress::ping(&self.inner, target).await
    }

    /// Sends a read receipt for an envelope this node received.
    pub async fn mark_read(&self, target: &AgentId, message_id: EnvelopeId) -> Result<()> {
        crate::egress::send_receipt(
            &self.inner,
            target,
            message_id,
            ai2ai_types::ReceiptStatus::Read,
        )
        .await
    }

    // -- Discovery --------------------------------------------------------

    /// Searches the configured registry.
    pub async fn discover(
        &self,
        capability: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<RegistryAgent>> {
        self.inner.discovery.search(capability, name).await
    }

    // -- Contacts and trust -----------------------------------------------

    /// Adds or updates a contact.
    pub fn add_contact(&self, agent_id: &AgentId, update: ContactUpdate) -> Result<()> {
        self.inner.contacts.upsert(agent_id, update)
    }

    /// Looks up a contact.
    pub fn get_contact(&self, agent_id: &AgentId) -> Result<Option<Contact>> {
        self.inner.contacts.get(agent_id)
    }

    /// Blocks a peer, inbound and outbound.
    pub fn block(&self, agent_id: &AgentId) -> Result<()> {
        self.inner.contacts.block(agent_id)
    }

    /// Unblocks a peer.
    pub fn unblock(&self, agent_id: &AgentId) -> Result<()> {
        self.inner.contacts.unblock(agent_id)
    }

    /// Sets a contact's trust level.
    pub fn set_trust(&self, agent_id: &AgentId, level: TrustLevel) -> Result<()> {
        self.inner.contacts.set_trust(agent_id, level)
    }

    /// Retries every dead letter exactly once, removing the ones
    /// that deliver. Operator-triggered only. Returns
    /// `(delivered, remaining)`.
    pub async fn retry_dead_letters(&self) -> Result<(usize, usize)> {
        // Collect first: retry_all is synchronous, delivery is not.
        let letters = self.inner.dlq.list()?;
        let mut delivered_ids = Vec::new();

        for letter in &letters {
            match self
                .inner
                .delivery
                .deliver_once(&letter.endpoint, &letter.envelope)
                .await
            {
                Ok(_) => delivered_ids.push(letter.id),
                Err(e) => {
                    tracing::debug!(id = %letter.id, error = %e, "dead letter retry failed");
                }
            }
        }

        let delivered = delivered_ids.len();
        self.inner.dlq.retry_all(|letter| {
            if delivered_ids.contains(&letter.id) {
                Ok(())
            } else {
                Err(Ai2AiError::Transport {
                    reason: "not delivered in this pass".into(),
                })
            }
        })?;

        Ok((delivered, letters.len() - delivered))
    }

    // -- Inspection -------------------------------------------------------

    /// Metadata for a conversation, if it exists.
    pub fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ai2ai_storage::conversations::ConversationMeta>> {
        self.inner.conversations.get(id)
    }

    /// A persistent-queue entry, if it is still queued.
    pub fn queued_entry(
        &self,
        id: &EnvelopeId,
    ) -> Result<Option<ai2ai_storage::queue::QueueEntry>> {
        self.inner.queue.get(id)
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<ai2ai_storage::dlq::DeadLetter>> {
        self.inner.dlq.list()
    }

    // -- Approvals --------------------------------------------------------

    /// Unresolved approvals, oldest first.
    pub fn pending_approvals(&self) -> Result<Vec<ai2ai_storage::approvals::PendingApproval>> {
        self.inner.approvals.list_unresolved()
    }

    /// Approves a pending item and sends the follow-up envelope:
    /// a `response` for held requests, a `confirm` for held
    /// responses.
    pub async fn approve(&self, approval_id: &EnvelopeId, reply: Option<String>) -> Result<()> {
        let approval = self
            .inner
            .approvals
            .resolve(approval_id, true, reply.clone())?;
        let envelope = approval.envelope;
        let peer = envelope.from.agent.clone();
        let conversation = envelope.conversation;

        self.inner.activity.record(
            "approval-approved",
            json!({ "id": approval_id.to_string(), "peer": peer.to_string() }),
        )?;

        match envelope.envelope_type {
            EnvelopeType::Request => {
                let outcome = self.run_handler(&envelope, reply.clone());
                let (reply_type, payload, next_state) = match outcome {
                    HandlerOutcome::Approved(payload) => {
                        (EnvelopeType::Response, payload, ConversationState::Negotiating)
                    }
                    HandlerOutcome::Counter(payload) => {
                        (EnvelopeType::Response, payload, ConversationState::Negotiating)
                    }
                    HandlerOutcome::Rejected(reason) => (
                        EnvelopeType::Reject,
                        json!({ "reason": reason }),
                        ConversationState::Rejected,
                    ),
                };

                let _ = self.inner.conversations.transition(&conversation, next_state);
                crate::egress::send_typed(
                    &self.inner,
                    &peer,
                    reply_type,
                    envelope.intent.clone(),
                    payload,
                    SendOptions {
                        conversation: Some(conversation),
                        ..SendOptions::default()
                    },
                )
                .await?;
            }
            EnvelopeType::Response => {
                // Accepting a peer's response closes the negotiation.
                let _ = self
                    .inner
                    .conversations
                    .transition(&conversation, ConversationState::Confirmed);
                crate::egress::send_typed(
                    &self.inner,
                    &peer,
                    EnvelopeType::Confirm,
                    envelope.intent.clone(),
                    json!({ "confirmed": true, "reply": reply }),
                    SendOptions {
                        conversation: Some(conversation),
                        ..SendOptions::default()
                    },
                )
                .await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Rejects a pending item and sends a `reject` envelope to the
    /// peer.
    pub async fn reject(&self, approval_id: &EnvelopeId, reason: Option<String>) -> Result<()> {
        let approval = self
            .inner
            .approvals
            .resolve(approval_id, false, reason.clone())?;
        let envelope = approval.envelope;
        let peer = envelope.from.agent.clone();
        let conversation = envelope.conversation;

        self.inner.activity.record(
            "approval-rejected",
            json!({ "id": approval_id.to_string(), "peer": peer.to_string() }),
        )?;

        let _ = self
            .inner
            .conversations
            .transition(&conversation, ConversationState::Rejected);

        crate::egress::send_typed(
            &self.inner,
            &peer,
            EnvelopeType::Reject,
            envelope.intent.clone(),
            json!({ "reason": reason.unwrap_or_else(|| "declined".into()) }),
            SendOptions {
                conversation: Some(conversation),
                ..SendOptions::default()
            },
        )
        .await?;
        Ok(())
    }

    // -- Internal ---------------------------------------------------------

    /// Runs the registered handler for an approved request, or builds
    /// a generic acceptance when no handler is registered.
    fn run_handler(&self, envelope: &Envelope, reply: Option<String>) -> HandlerOutcome {
        let payload = match &envelope.payload {
            ai2ai_protocol::envelope::Payload::Plain(value) => value.clone(),
            ai2ai_protocol::envelope::Payload::Encrypted(_) => Value::Null,
        };
        let request = IntentRequest {
            envelope: envelope.clone(),
            payload,
            reply: reply.clone(),
        };

        match envelope.intent.as_deref().and_then(|i| self.inner.intents.get(i)) {
            Some(handler) => handler.handle(&request),
            None => HandlerOutcome::Approved(json!({
                "approved": true,
                "reply": reply,
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry presence
// ---------------------------------------------------------------------------

/// Heartbeat cadence; well inside the registry's 2-minute staleness
/// window.
const REGISTRY_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Registers this node with the configured registry, then heartbeats
/// until shutdown.
async fn registry_presence(inner: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    let agent_id = inner.agent_id();
    let registration = {
        let public_key = inner
            .keys
            .read()
            .map(|keys| keys.signing_keys().public_key().to_hex())
            .unwrap_or_default();
        RegistryAgent {
            id: inner.config.name.clone(),
            endpoint: crate::egress::advertised_endpoint(&inner),
            name: Some(inner.config.name.clone()),
            human_name: Some(inner.config.human_name.clone()),
            public_key: Some(public_key),
            capabilities: inner.intents.names(),
            metadata: json!({}),
        }
    };

    if let Err(e) = inner.discovery.register(&registration).await {
        tracing::warn!(error = %e, "registry registration failed");
    }

    let mut tick = tokio::time::interval(REGISTRY_HEARTBEAT_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = inner.discovery.heartbeat(&agent_id).await {
                    tracing::debug!(error = %e, "registry heartbeat failed");
                }
            }
            _ = shutdown.changed() => {
                let _ = inner.discovery.deregister(&agent_id).await;
                break;
            }
        }
    }
}
