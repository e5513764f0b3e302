//! Periodic maintenance sweep.
//!
//! On each tick (hourly by default):
//!
//! 1. Expire non-terminal conversations idle past their expiry.
//! 2. Auto-reject pending approvals older than `approval_ttl_ms`,
//!    answering the peer with a `reject` envelope.
//! 3. Purge resolved approvals older than seven days.
//! 4. Enforce activity-log retention.
//! 5. Rotate the signing key when it is due, announcing the new key
//!    to every known, unblocked contact.

use std::sync::Arc;
use std::time::Duration;

use ai2ai_types::{Ai2AiError, ConversationState, EnvelopeType, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use crate::egress::{self, SendOptions};
use crate::events::NodeEvent;
use crate::node::NodeInner;

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Resolved approvals are retained this long before purge.
const RESOLVED_RETENTION_MS: u64 = 7 * 86_400_000;

/// Sweeper entry point; exits when `shutdown` fires.
pub(crate) async fn run(inner: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // The first interval tick fires immediately; skip it so startup
    // does not race the stores.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = sweep(&inner).await {
                    tracing::warn!(error = %e, "maintenance sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("maintenance sweeper shutting down");
                break;
            }
        }
    }
}

/// One full maintenance pass.
pub(crate) async fn sweep(inner: &Arc<NodeInner>) -> Result<()> {
    let now = Utc::now();

    // 1. Conversation expiry.
    let expired = inner
        .conversations
        .expire_stale(inner.config.conversation_expiry_ms, now)?;
    for id in expired {
        if let Some(meta) = inner.conversations.get(&id)? {
            inner.events.emit(&NodeEvent::Notification {
                conversation: id,
                state: ConversationState::Expired,
                from: meta.initiator.clone(),
            });
        }
        inner
            .activity
            .record("conversation-expired", json!({ "id": id.to_string() }))?;
    }

    // 2. Approval TTL.
    let timed_out = inner
        .approvals
        .expire_unresolved(inner.config.approval_ttl_ms, now)?;
    for approval in timed_out {
        inner.events.emit(&NodeEvent::ApprovalExpired {
            approval_id: approval.id,
        });
        inner
            .activity
            .record("approval-expired", json!({ "id": approval.id.to_string() }))?;

        let _ = inner.conversations.transition(
            &approval.envelope.conversation,
            ConversationState::Rejected,
        );

        // Best-effort reject back to the peer.
        let peer = approval.envelope.from.agent.clone();
        let result = egress::send_typed(
            inner,
            &peer,
            EnvelopeType::Reject,
            approval.envelope.intent.clone(),
            json!({ "reason": "approval timed out" }),
            SendOptions {
                conversation: Some(approval.envelope.conversation),
                queue_on_failure: false,
                ..SendOptions::default()
            },
        )
        .await;
        if let Err(e) = result {
            tracing::debug!(peer = %peer, error = %e, "expiry reject not delivered");
        }
    }

    // 3. Resolved-approval purge.
    let purged = inner.approvals.purge_resolved(RESOLVED_RETENTION_MS, now)?;
    if purged > 0 {
        tracing::debug!(purged, "purged resolved approvals");
    }

    // 4. Log retention.
    inner.activity.sweep_retention()?;

    // 5. Key rotation.
    rotate_if_due(inner).await?;

    Ok(())
}

/// Rotates the signing key when the interval has elapsed and
/// announces the new key to every known, unblocked contact.
async fn rotate_if_due(inner: &Arc<NodeInner>) -> Result<()> {
    let due = inner
        .keys
        .read()
        .map_err(|e| Ai2AiError::Internal {
            reason: format!("key store lock poisoned: {e}"),
        })?
        .needs_rotation(inner.config.rotation_interval_ms);
    if !due {
        return Ok(());
    }

    let (new_public, x_public) = {
        let mut keys = inner.keys.write().map_err(|e| Ai2AiError::Internal {
            reason: format!("key store lock poisoned: {e}"),
        })?;
        let outcome = keys.rotate()?;
        (
            outcome.new_public.to_hex(),
            hex::encode(keys.agreement_keys().public_key().as_bytes()),
        )
    };

    inner
        .activity
        .record("key-rotated", json!({ "publicKey": new_public }))?;

    // Announce to peers whose signatures we still honor.
    for (agent_id, contact) in inner.contacts.list()? {
        if contact.ed_public_key.is_none() || inner.contacts.is_blocked(&agent_id)? {
            continue;
        }
        let result = egress::send_typed(
            inner,
            &agent_id,
            EnvelopeType::KeyRotation,
            None,
            json!({
                "newPublicKey": new_public,
                "x25519PublicKey": x_public,
            }),
            SendOptions::default(),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(peer = %agent_id, error = %e, "key rotation announcement failed");
        }
    }

    Ok(())
}
