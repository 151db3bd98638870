//! Polling delivery worker: pushes undelivered notifications to agent
//! sessions.
//!
//! A timer-driven loop decoupled from the request path. Each cycle polls the
//! notification store per roster agent, attempts delivery through the
//! gateway, and marks rows delivered only on confirmed success. Failures
//! back off per notification, so one stuck recipient never stalls the rest.
//! Delivery is at-least-once: a send that succeeds but fails to be marked is
//! retried rather than dropped.

use crate::delivery::backoff::BackoffTracker;
use crate::delivery::gateway::SessionGateway;
use crate::delivery::log::{AttemptLog, AttemptOutcome};
use crate::notify::store::NotificationStore;
use crate::notify::types::Notification;
use crate::roster::Roster;

use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Counters shared with the IPC status endpoint.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub cycles: AtomicU64,
    pub delivered: AtomicU64,
    pub failures: AtomicU64,
}

/// Point-in-time view of the counters for status replies.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryStatsSnapshot {
    pub cycles: u64,
    pub delivered: u64,
    pub failures: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// The long-running delivery loop.
pub struct DeliveryWorker<G> {
    store: NotificationStore,
    roster: Roster,
    gateway: G,
    attempt_log: Arc<AttemptLog>,
    backoff: BackoffTracker,
    poll_interval: Duration,
    stats: Arc<DeliveryStats>,
}

struct AttemptResult {
    notification_id: String,
    outcome: AttemptOutcome,
}

impl<G: SessionGateway> DeliveryWorker<G> {
    pub fn new(
        store: NotificationStore,
        roster: Roster,
        gateway: G,
        attempt_log: Arc<AttemptLog>,
        poll_interval: Duration,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            store,
            roster,
            gateway,
            attempt_log,
            backoff: BackoffTracker::new(),
            poll_interval,
            stats,
        }
    }

    /// Run until the shutdown channel flips. A failed cycle is logged and
    /// never exits the loop: crash-restart is the supervisor's job, routine
    /// errors are ours.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            agents = self.roster.len(),
            poll_interval = ?self.poll_interval,
            "delivery worker starting"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(Instant::now()).await;
                    self.stats.cycles.fetch_add(1, Ordering::Relaxed);
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("delivery worker shutting down");
                    break;
                }
            }
        }
    }

    /// One polling cycle. Fetches per-agent batches concurrently, delivers
    /// concurrently across agents but sequentially within each agent (a row
    /// can never be in flight twice in-process), then folds the outcomes
    /// back into the backoff map.
    pub async fn run_cycle(&mut self, now: Instant) {
        let fetches = self.roster.agent_ids().map(|agent_id| {
            let store = self.store.clone();
            let agent_id = agent_id.to_string();
            async move {
                match store.get_undelivered(&agent_id).await {
                    Ok(rows) => Some((agent_id, rows)),
                    Err(error) => {
                        tracing::error!(
                            %agent_id,
                            %error,
                            "failed to fetch undelivered notifications, retrying next cycle"
                        );
                        None
                    }
                }
            }
        });
        let mut batches: Vec<(String, Vec<Notification>)> =
            join_all(fetches).await.into_iter().flatten().collect();

        // Backoff gate, applied while the tracker is exclusively ours.
        for (_, rows) in &mut batches {
            rows.retain(|notification| self.backoff.is_due(&notification.id, now));
        }
        batches.retain(|(_, rows)| !rows.is_empty());
        if batches.is_empty() {
            return;
        }

        let deliveries = batches
            .into_iter()
            .map(|(agent_id, rows)| self.deliver_batch(agent_id, rows));
        let outcomes: Vec<AttemptResult> =
            join_all(deliveries).await.into_iter().flatten().collect();

        for attempt in outcomes {
            if attempt.outcome.needs_retry() {
                let delay = self.backoff.record_failure(&attempt.notification_id, now);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    notification_id = %attempt.notification_id,
                    outcome = attempt.outcome.as_str(),
                    retry_in = ?delay,
                    "delivery attempt failed"
                );
            } else {
                self.backoff.clear(&attempt.notification_id);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Deliver one agent's due notifications, strictly in order.
    async fn deliver_batch(
        &self,
        agent_id: String,
        rows: Vec<Notification>,
    ) -> Vec<AttemptResult> {
        let Some(session_key) = self.roster.session_key_for(&agent_id) else {
            tracing::error!(
                %agent_id,
                pending = rows.len(),
                "no session key for agent, leaving notifications undelivered"
            );
            return rows
                .into_iter()
                .map(|notification| {
                    self.attempt_log.append(
                        &notification.id,
                        &agent_id,
                        AttemptOutcome::NoSession,
                        Some("no session key in roster"),
                    );
                    AttemptResult {
                        notification_id: notification.id,
                        outcome: AttemptOutcome::NoSession,
                    }
                })
                .collect();
        };

        let mut results = Vec::with_capacity(rows.len());
        for notification in rows {
            let outcome = self.attempt(&notification, &agent_id, session_key).await;
            results.push(AttemptResult {
                notification_id: notification.id,
                outcome,
            });
        }
        results
    }

    /// One delivery attempt: send through the gateway, then mark the row.
    async fn attempt(
        &self,
        notification: &Notification,
        agent_id: &str,
        session_key: &str,
    ) -> AttemptOutcome {
        let text = format_notification(notification, &self.roster);

        match self.gateway.deliver(session_key, agent_id, &text).await {
            Ok(()) => match self.store.mark_delivered(&notification.id).await {
                Ok(()) => {
                    self.attempt_log
                        .append(&notification.id, agent_id, AttemptOutcome::Delivered, None);
                    tracing::info!(
                        notification_id = %notification.id,
                        %agent_id,
                        "notification delivered"
                    );
                    AttemptOutcome::Delivered
                }
                Err(error) => {
                    // The send went through but the store write did not.
                    // Leave the row undelivered: the next attempt may deliver
                    // it twice, which beats losing it.
                    let error = error.to_string();
                    self.attempt_log.append(
                        &notification.id,
                        agent_id,
                        AttemptOutcome::MarkFailed,
                        Some(&error),
                    );
                    tracing::error!(
                        notification_id = %notification.id,
                        %agent_id,
                        %error,
                        "delivered but failed to mark, will retry"
                    );
                    AttemptOutcome::MarkFailed
                }
            },
            Err(error) => {
                let error = error.to_string();
                self.attempt_log.append(
                    &notification.id,
                    agent_id,
                    AttemptOutcome::SendFailed,
                    Some(&error),
                );
                tracing::warn!(
                    notification_id = %notification.id,
                    %agent_id,
                    %error,
                    "session send failed"
                );
                AttemptOutcome::SendFailed
            }
        }
    }
}

/// Payload text pushed into the recipient's session.
fn format_notification(notification: &Notification, roster: &Roster) -> String {
    let recipient = roster.display_name(&notification.mentioned_agent_id);
    let sender = roster.display_name(&notification.from_agent_id);
    format!(
        "[notification] @{recipient}: {content} (from {sender})",
        content = notification.content
    )
}
