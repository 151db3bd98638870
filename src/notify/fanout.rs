//! Fan-out rule engine: who gets notified when a message is posted.
//!
//! The rules are small but load-bearing: the sender is never notified, and
//! each recipient gets exactly one notification per message even when they
//! are both mentioned and subscribed.

use crate::error::Result;
use crate::notify::store::NotificationStore;
use crate::notify::types::NewNotification;

use std::collections::HashSet;

/// Compute the recipient set for a message, deterministically.
///
/// Explicit mentions come first in input order, then subscribers in input
/// order; the first occurrence of an id wins and the sender is always
/// excluded. Self-mentions and sender-as-subscriber are dropped silently,
/// as rule outcomes rather than errors.
pub fn compute_recipients(
    from_agent_id: &str,
    mentions: &[String],
    subscribers: &[String],
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();

    for agent_id in mentions.iter().chain(subscribers) {
        if agent_id == from_agent_id {
            continue;
        }
        if seen.insert(agent_id.as_str()) {
            recipients.push(agent_id.clone());
        }
    }

    recipients
}

/// Fan a posted message out into notification rows.
///
/// `subscribers` is `None` when the task could not be loaded at fan-out
/// time: explicit mentions still fire, subscriber-based notifications are
/// skipped. Zero recipients is a valid no-op. One bulk insert per message;
/// a store failure propagates so the caller's post fails instead of
/// silently losing notifications.
pub async fn fan_out(
    store: &NotificationStore,
    from_agent_id: &str,
    content: &str,
    task_id: &str,
    mentions: &[String],
    subscribers: Option<&[String]>,
) -> Result<Vec<String>> {
    let recipients = compute_recipients(from_agent_id, mentions, subscribers.unwrap_or(&[]));
    if recipients.is_empty() {
        return Ok(Vec::new());
    }

    let batch: Vec<NewNotification> = recipients
        .iter()
        .map(|recipient| NewNotification {
            mentioned_agent_id: recipient.clone(),
            from_agent_id: from_agent_id.to_string(),
            content: content.to_string(),
            task_id: Some(task_id.to_string()),
        })
        .collect();

    store.create_bulk(&batch).await?;

    tracing::debug!(
        from = %from_agent_id,
        task_id = %task_id,
        recipients = recipients.len(),
        "fanned out message notifications"
    );

    Ok(recipients)
}
