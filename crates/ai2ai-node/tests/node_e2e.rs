//! Two-node end-to-end tests over real localhost HTTP.
//!
//! Each test runs its own node pair on dedicated ports with isolated
//! temp data directories, so tests can execute concurrently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai2ai_node::{
    HandlerOutcome, IntentHandler, IntentRequest, Node, NodeEvent, SendOptions, SendOutcome,
};
use ai2ai_storage::contacts::ContactUpdate;
use ai2ai_types::config::NodeConfig;
use ai2ai_types::{Ai2AiError, AgentId, ConversationState, TrustLevel};
use serde_json::json;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestNode {
    node: Node,
    _data: TempDir,
    events: Arc<Mutex<Vec<String>>>,
    endpoint: String,
}

async fn spawn_node(name: &str, port: u16) -> Result<TestNode, Ai2AiError> {
    let data = TempDir::new().map_err(|e| Ai2AiError::Storage {
        reason: e.to_string(),
    })?;

    let endpoint = format!("http://127.0.0.1:{port}/ai2ai");
    let config = NodeConfig {
        name: name.to_owned(),
        human_name: format!("{name} operator"),
        port,
        endpoint: Some(endpoint.clone()),
        data_dir: data.path().to_path_buf(),
        timeout_ms: 2_000,
        queue_retry_schedule_ms: vec![200, 400, 800],
        ..NodeConfig::default()
    };

    let mut node = Node::new(config)?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    node.on(move |event: &NodeEvent| {
        if let Ok(mut log) = sink.lock() {
            log.push(event.kind().to_owned());
        }
    });

    node.start().await?;

    Ok(TestNode {
        node,
        _data: data,
        events,
        endpoint,
    })
}

fn event_count(node: &TestNode, kind: &str) -> usize {
    node.events
        .lock()
        .map(|log| log.iter().filter(|k| k.as_str() == kind).count())
        .unwrap_or(0)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

// ---------------------------------------------------------------------------
// Intent handlers
// ---------------------------------------------------------------------------

/// Scheduling handler: the operator's reply picks the accepted slot
/// by 1-based index.
struct ScheduleHandler;

impl IntentHandler for ScheduleHandler {
    fn handle(&self, request: &IntentRequest) -> HandlerOutcome {
        let times: Vec<String> = request
            .payload
            .get("proposed_times")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let index = request
            .reply
            .as_deref()
            .and_then(|r| r.trim().parse::<usize>().ok())
            .unwrap_or(1);

        match times.get(index.saturating_sub(1)) {
            Some(accepted) => HandlerOutcome::Approved(json!({ "accepted_time": accepted })),
            None => HandlerOutcome::Rejected("no such slot".into()),
        }
    }
}

/// Echo handler that never needs approval on its own.
struct EchoHandler;

impl IntentHandler for EchoHandler {
    fn handle(&self, request: &IntentRequest) -> HandlerOutcome {
        HandlerOutcome::Approved(request.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// 1. Ping handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_handshake_learns_peer_identity() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_001).await?;
    let b = spawn_node("bob.test", 19_002).await?;

    // A only knows B's endpoint; keys are learned by the handshake.
    a.node.add_contact(
        &b.node.agent_id(),
        ContactUpdate {
            endpoint: Some(b.endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;

    let outcome = a.node.ping(&b.node.agent_id()).await?;
    match outcome {
        SendOutcome::Accepted { response, .. } => {
            assert_eq!(response.status, "ok");
            assert_eq!(response.response_type.as_deref(), Some("ping"));
            let payload = response.payload.ok_or(Ai2AiError::Internal {
                reason: "ping answer carried no payload".into(),
            })?;
            assert!(payload.get("publicKey").is_some());
            assert!(payload.get("x25519PublicKey").is_some());
        }
        SendOutcome::Queued { .. } => {
            return Err(Ai2AiError::Internal {
                reason: "ping should complete synchronously".into(),
            })
        }
    }

    // A's registry now holds B's keys and fingerprint material.
    let contact = a.node.get_contact(&b.node.agent_id())?.ok_or(Ai2AiError::Internal {
        reason: "contact missing after ping".into(),
    })?;
    assert!(contact.ed_public_key.is_some());
    assert!(contact.x_public_key.is_some());

    // B learned A symmetrically from the ping payload.
    let reverse = b.node.get_contact(&a.node.agent_id())?.ok_or(Ai2AiError::Internal {
        reason: "reverse contact missing".into(),
    })?;
    assert!(reverse.ed_public_key.is_some());
    Ok(())
}

// ---------------------------------------------------------------------------
// 2. Schedule negotiation to confirmed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn schedule_negotiation_reaches_confirmed_on_both_sides() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_003).await?;
    let b = spawn_node("bob.test", 19_004).await?;
    b.node.register_intent("schedule.meeting", Arc::new(ScheduleHandler));

    a.node.add_contact(
        &b.node.agent_id(),
        ContactUpdate {
            endpoint: Some(b.endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;
    a.node.ping(&b.node.agent_id()).await?;

    // A proposes three slots.
    let outcome = a
        .node
        .request(
            &b.node.agent_id(),
            "schedule.meeting",
            json!({
                "proposed_times": [
                    "2026-03-10T10:00Z",
                    "2026-03-10T14:00Z",
                    "2026-03-11T09:00Z",
                ],
            }),
            SendOptions::default(),
        )
        .await?;

    let conversation = match outcome {
        SendOutcome::Accepted { response, .. } => {
            assert_eq!(response.status, "pending_approval");
            response
                .conversation
                .ok_or(Ai2AiError::Internal {
                    reason: "no conversation echoed".into(),
                })?
                .parse::<ai2ai_types::ConversationId>()?
        }
        SendOutcome::Queued { .. } => {
            return Err(Ai2AiError::Internal {
                reason: "request should reach B synchronously".into(),
            })
        }
    };

    // B's operator approves slot 2.
    settle().await;
    let pending = b.node.pending_approvals()?;
    assert_eq!(pending.len(), 1);
    b.node.approve(&pending[0].id, Some("2".into())).await?;

    // A's operator receives the response and confirms.
    settle().await;
    let pending_at_a = a.node.pending_approvals()?;
    assert_eq!(pending_at_a.len(), 1);
    a.node.approve(&pending_at_a[0].id, None).await?;
    settle().await;

    // Both sides converge on `confirmed`.
    for test_node in [&a, &b] {
        let meta = test_node
            .node
            .conversation(&conversation)?
            .ok_or(Ai2AiError::Internal {
                reason: "conversation missing".into(),
            })?;
        assert_eq!(meta.state, ConversationState::Confirmed);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Replay attack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_envelope_is_rejected() -> Result<(), Ai2AiError> {
    use ai2ai_crypto::signing::Keypair;
    use ai2ai_protocol::envelope::{EnvelopeBuilder, Party};
    use ai2ai_protocol::signing::sign_envelope;
    use ai2ai_types::{ConversationId, EnvelopeType};

    let b = spawn_node("bob.test", 19_005).await?;

    let keypair = Keypair::from_seed(&[0x5A; 32]);
    let mut envelope = EnvelopeBuilder::new(
        Party {
            agent: AgentId::new("mallory.test"),
            human: "Mallory".into(),
        },
        b.node.agent_id(),
        ConversationId::generate(),
        EnvelopeType::Message,
    )
    .payload(json!({ "message": "hello" }))
    .build();
    sign_envelope(&mut envelope, &keypair)?;

    let bytes = serde_json::to_vec(&envelope).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;

    let client = reqwest::Client::new();
    let first = client
        .post(&b.endpoint)
        .header("Content-Type", "application/json")
        .body(bytes.clone())
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(first.status(), 200);

    // Identical bytes again: the nonce is already burned.
    let second = client
        .post(&b.endpoint)
        .header("Content-Type", "application/json")
        .body(bytes)
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(second.status(), 400);
    let body: serde_json::Value = second.json().await.map_err(|e| Ai2AiError::Transport {
        reason: e.to_string(),
    })?;
    assert_eq!(body["reason"], json!("replay_detected"));

    // Exactly one observable event.
    settle().await;
    assert_eq!(event_count(&b, "message"), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// Dedup idempotence (fresh nonce, same id)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_id_returns_duplicate_status() -> Result<(), Ai2AiError> {
    use ai2ai_crypto::signing::Keypair;
    use ai2ai_protocol::envelope::{generate_nonce, EnvelopeBuilder, Party};
    use ai2ai_protocol::signing::sign_envelope;
    use ai2ai_types::{ConversationId, EnvelopeType};

    let b = spawn_node("bob.test", 19_006).await?;

    let keypair = Keypair::from_seed(&[0x5B; 32]);
    let mut envelope = EnvelopeBuilder::new(
        Party {
            agent: AgentId::new("carol.test"),
            human: "Carol".into(),
        },
        b.node.agent_id(),
        ConversationId::generate(),
        EnvelopeType::Message,
    )
    .payload(json!({ "message": "once only" }))
    .build();
    sign_envelope(&mut envelope, &keypair)?;

    let client = reqwest::Client::new();
    let first = client
        .post(&b.endpoint)
        .json(&envelope)
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(first.status(), 200);

    // Same id with a fresh nonce: dedup answers, no second event.
    // The nonce is unsigned, so the signature stays valid.
    envelope.nonce = Some(generate_nonce());
    let second = client
        .post(&b.endpoint)
        .json(&envelope)
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(second.status(), 200);
    let body: serde_json::Value = second.json().await.map_err(|e| Ai2AiError::Transport {
        reason: e.to_string(),
    })?;
    assert_eq!(body["status"], json!("duplicate"));

    settle().await;
    assert_eq!(event_count(&b, "message"), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Offline peer → queue → redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_peer_send_queues_and_recovers() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_007).await?;

    let bob_id = AgentId::new("bob.test");
    let bob_endpoint = "http://127.0.0.1:19008/ai2ai".to_owned();
    a.node.add_contact(
        &bob_id,
        ContactUpdate {
            endpoint: Some(bob_endpoint),
            ..ContactUpdate::default()
        },
    )?;

    // B is down: the interactive send falls back to the queue.
    let outcome = a
        .node
        .send(&bob_id, "are you there?", SendOptions::default())
        .await?;
    let queued_id = match outcome {
        SendOutcome::Queued { id } => id,
        SendOutcome::Accepted { .. } => {
            return Err(Ai2AiError::Internal {
                reason: "send should have queued".into(),
            })
        }
    };

    // Bring B up; A's queue worker delivers on a later tick.
    let b = spawn_node("bob.test", 19_008).await?;

    let mut delivered = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if event_count(&b, "message") >= 1 {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "queued envelope never arrived at B");

    // Exactly one event for this id, and the queue entry is gone.
    assert_eq!(event_count(&b, "message"), 1);
    assert!(a.node.queued_entry(&queued_id)?.is_none());
    Ok(())
}

// ---------------------------------------------------------------------------
// 6. Commerce guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn commerce_requests_always_need_approval() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_009).await?;
    let b = spawn_node("bob.test", 19_010).await?;
    b.node.register_intent("commerce.request", Arc::new(EchoHandler));

    a.node.add_contact(
        &b.node.agent_id(),
        ContactUpdate {
            endpoint: Some(b.endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;
    a.node.ping(&b.node.agent_id()).await?;

    // Even with full trust, commerce never auto-dispatches.
    b.node.set_trust(&a.node.agent_id(), TrustLevel::Trusted)?;

    let outcome = a
        .node
        .request(
            &b.node.agent_id(),
            "commerce.request",
            json!({ "item": "Widget", "budget": "500 GBP" }),
            SendOptions::default(),
        )
        .await?;

    match outcome {
        SendOutcome::Accepted { response, .. } => {
            assert_eq!(response.status, "pending_approval");
        }
        SendOutcome::Queued { .. } => {
            return Err(Ai2AiError::Internal {
                reason: "request should reach B synchronously".into(),
            })
        }
    }

    settle().await;
    assert_eq!(b.node.pending_approvals()?.len(), 1);
    assert_eq!(event_count(&b, "request"), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Trusted non-commerce requests auto-dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trusted_peer_bypasses_approval_for_plain_intents() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_011).await?;
    let b = spawn_node("bob.test", 19_012).await?;
    b.node.register_intent("status.report", Arc::new(EchoHandler));

    a.node.add_contact(
        &b.node.agent_id(),
        ContactUpdate {
            endpoint: Some(b.endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;
    a.node.ping(&b.node.agent_id()).await?;
    b.node.set_trust(&a.node.agent_id(), TrustLevel::Trusted)?;

    let outcome = a
        .node
        .request(
            &b.node.agent_id(),
            "status.report",
            json!({ "query": "uptime" }),
            SendOptions::default(),
        )
        .await?;

    match outcome {
        SendOutcome::Accepted { response, .. } => assert_eq!(response.status, "ok"),
        SendOutcome::Queued { .. } => {
            return Err(Ai2AiError::Internal {
                reason: "request should reach B synchronously".into(),
            })
        }
    }

    settle().await;
    assert_eq!(event_count(&b, "request"), 1);
    assert!(b.node.pending_approvals()?.is_empty());
    // A received B's auto-response and holds it for confirmation.
    assert_eq!(a.node.pending_approvals()?.len(), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocked senders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocked_sender_gets_403() -> Result<(), Ai2AiError> {
    let a = spawn_node("alice.test", 19_013).await?;
    let b = spawn_node("bob.test", 19_014).await?;

    a.node.add_contact(
        &b.node.agent_id(),
        ContactUpdate {
            endpoint: Some(b.endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;
    b.node.block(&a.node.agent_id())?;

    let result = a
        .node
        .send(
            &b.node.agent_id(),
            "hello?",
            SendOptions {
                queue_on_failure: false,
                ..SendOptions::default()
            },
        )
        .await;

    assert!(matches!(result, Err(Ai2AiError::Blocked { .. })));
    settle().await;
    assert_eq!(event_count(&b, "message"), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Health and discovery documents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_and_well_known_documents() -> Result<(), Ai2AiError> {
    let b = spawn_node("bob.test", 19_015).await?;
    b.node.register_intent("schedule.meeting", Arc::new(ScheduleHandler));

    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get("http://127.0.0.1:19015/ai2ai/health")
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?
        .json()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(health["status"], json!("online"));
    assert_eq!(health["protocol"], json!("1.0"));
    assert_eq!(health["intents"], json!(["schedule.meeting"]));

    let descriptor: serde_json::Value = client
        .get("http://127.0.0.1:19015/.well-known/ai2ai.json")
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?
        .json()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;
    assert_eq!(descriptor["ai2ai"], json!("1.0"));
    assert_eq!(descriptor["agent"], json!("bob.test"));
    assert!(descriptor.get("fingerprint").is_some());
    Ok(())
}

// ---------------------------------------------------------------------------
// Oversized bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oversized_body_is_refused() -> Result<(), Ai2AiError> {
    let b = spawn_node("bob.test", 19_016).await?;

    let client = reqwest::Client::new();
    let response = client
        .post(&b.endpoint)
        .header("Content-Type", "application/json")
        .body(vec![b'x'; 150 * 1024])
        .send()
        .await
        .map_err(|e| Ai2AiError::Transport {
            reason: e.to_string(),
        })?;

    assert_eq!(response.status(), 413);
    Ok(())
}
