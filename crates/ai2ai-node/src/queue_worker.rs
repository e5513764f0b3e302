//! Background queue drain.
//!
//! Polls the persistent queue and retries pending entries on the
//! coarse schedule from `queue_retry_schedule_ms` (default 1 m, 5 m,
//! 30 m, 2 h, 12 h). Each entry gets at most one in-flight delivery
//! at a time; an entry whose schedule is exhausted moves to the dead
//! letter store with exactly one `failed` event.

use std::sync::Arc;
use std::time::Duration;

use ai2ai_storage::queue::{QueueEntry, QueueStatus};
use ai2ai_types::ReceiptStatus;
use chrono::Utc;
use tokio::sync::watch;

use crate::events::NodeEvent;
use crate::node::NodeInner;

/// Queue poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Worker entry point; exits when `shutdown` fires.
pub(crate) async fn run(inner: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = drain(&inner).await {
                    tracing::warn!(error = %e, "queue drain pass failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("queue worker shutting down");
                break;
            }
        }
    }
}

/// One drain pass: attempt every ready entry once.
pub(crate) async fn drain(inner: &Arc<NodeInner>) -> ai2ai_types::Result<()> {
    let schedule = &inner.config.queue_retry_schedule_ms;

    // dequeue() marks expired entries in place as a side effect.
    let _ = inner.queue.dequeue()?;

    let entries: Vec<QueueEntry> = inner
        .queue
        .list()?
        .into_iter()
        .filter(|entry| entry.status == QueueStatus::Pending && is_ready(entry, schedule))
        .collect();

    for entry in entries {
        attempt(inner, entry).await?;
    }
    Ok(())
}

/// An entry is ready when its backoff delay has elapsed. The first
/// queued attempt runs on the next tick; afterwards the schedule
/// indexes by failure count.
fn is_ready(entry: &QueueEntry, schedule: &[u64]) -> bool {
    let Some(last) = entry.last_attempt else {
        return true;
    };
    if entry.attempts == 0 {
        return true;
    }

    let index = (entry.attempts as usize - 1).min(schedule.len() - 1);
    let delay_ms = schedule[index] as i64;
    Utc::now().signed_duration_since(last).num_milliseconds() >= delay_ms
}

/// One delivery attempt for one entry.
async fn attempt(inner: &Arc<NodeInner>, entry: QueueEntry) -> ai2ai_types::Result<()> {
    let schedule_len = inner.config.queue_retry_schedule_ms.len() as u32;

    // Exhausted: one dead letter, one failed event.
    if entry.attempts > schedule_len {
        return dead_letter(inner, entry).await;
    }

    tracing::debug!(
        id = %entry.id,
        attempts = entry.attempts,
        endpoint = %entry.endpoint,
        "queued delivery attempt"
    );

    match inner.delivery.deliver_once(&entry.endpoint, &entry.envelope).await {
        Ok(_) => {
            inner.queue.complete(&entry.id)?;
            if inner.tracker.advance(entry.id, ReceiptStatus::Delivered) {
                inner.events.emit(&NodeEvent::Delivered {
                    id: entry.id,
                    to: entry.envelope.to.agent.clone(),
                });
            }
            inner.activity.record(
                "queue-delivered",
                serde_json::json!({ "id": entry.id.to_string(), "attempts": entry.attempts }),
            )?;
            Ok(())
        }
        Err(e) if e.is_retryable() || matches!(e, ai2ai_types::Ai2AiError::CircuitOpen { .. }) => {
            let updated = inner.queue.fail(&entry.id, &e.to_string())?;
            if updated.attempts > schedule_len {
                dead_letter(inner, updated).await
            } else {
                Ok(())
            }
        }
        Err(e) => {
            // Protocol rejection: retrying the same bytes will never
            // succeed.
            tracing::warn!(id = %entry.id, error = %e, "queued envelope rejected by peer");
            let mut final_entry = entry;
            final_entry.last_error = Some(e.to_string());
            dead_letter(inner, final_entry).await
        }
    }
}

/// Moves an entry to the dead letter store, emitting one `failed`
/// event.
async fn dead_letter(inner: &Arc<NodeInner>, entry: QueueEntry) -> ai2ai_types::Result<()> {
    let error = entry
        .last_error
        .clone()
        .unwrap_or_else(|| "delivery attempts exhausted".into());

    inner.queue.fail_terminal(&entry.id)?;
    inner.dlq.push(
        entry.envelope.clone(),
        entry.endpoint.clone(),
        error.clone(),
        entry.attempts,
    )?;

    if inner.tracker.advance(entry.id, ReceiptStatus::Failed) {
        inner.events.emit(&NodeEvent::Failed {
            id: entry.id,
            to: entry.envelope.to.agent.clone(),
            error: error.clone(),
        });
    }
    inner.activity.record(
        "queue-dead-letter",
        serde_json::json!({ "id": entry.id.to_string(), "error": error }),
    )?;

    tracing::warn!(id = %entry.id, "delivery moved to dead letter store");
    Ok(())
}
