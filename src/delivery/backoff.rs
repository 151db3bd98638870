//! Per-notification retry backoff.
//!
//! An explicit map keyed by notification id, owned by the delivery worker
//! and threaded through its polling loop. Methods take the current
//! `Instant` from the caller so tests can drive the clock. State is
//! process-local: a daemon restart resets every entry to the initial delay,
//! which is fine because the durable undelivered rows carry correctness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Delay schedule for consecutive failures, capped at the last entry.
const RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 16];

fn delay_for_failures(failures: u32) -> Duration {
    let index = (failures as usize).min(RETRY_DELAYS_SECS.len() - 1);
    Duration::from_secs(RETRY_DELAYS_SECS[index])
}

#[derive(Debug)]
struct BackoffEntry {
    failures: u32,
    next_attempt_at: Instant,
}

/// Tracks retry eligibility per notification id.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt for this notification is allowed at `now`.
    /// Unknown ids are always due.
    pub fn is_due(&self, notification_id: &str, now: Instant) -> bool {
        self.entries
            .get(notification_id)
            .is_none_or(|entry| now >= entry.next_attempt_at)
    }

    /// Record a failed attempt and return the delay until the next one.
    /// Consecutive failures walk the schedule: 1s, 2s, 4s, 8s, then 16s
    /// capped.
    pub fn record_failure(&mut self, notification_id: &str, now: Instant) -> Duration {
        let entry = self
            .entries
            .entry(notification_id.to_string())
            .or_insert(BackoffEntry {
                failures: 0,
                next_attempt_at: now,
            });

        let delay = delay_for_failures(entry.failures);
        entry.failures = entry.failures.saturating_add(1);
        entry.next_attempt_at = now + delay;
        delay
    }

    /// Retire a notification's backoff state after a successful delivery.
    pub fn clear(&mut self, notification_id: &str) {
        self.entries.remove(notification_id);
    }

    /// Number of notifications currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_doubles_and_caps_at_sixteen_seconds() {
        assert_eq!(delay_for_failures(0), Duration::from_secs(1));
        assert_eq!(delay_for_failures(1), Duration::from_secs(2));
        assert_eq!(delay_for_failures(2), Duration::from_secs(4));
        assert_eq!(delay_for_failures(3), Duration::from_secs(8));
        assert_eq!(delay_for_failures(4), Duration::from_secs(16));
        assert_eq!(delay_for_failures(50), Duration::from_secs(16));
    }

    #[test]
    fn consecutive_failures_use_non_decreasing_delays() {
        let mut tracker = BackoffTracker::new();
        let now = Instant::now();

        let mut previous = Duration::ZERO;
        for _ in 0..8 {
            let delay = tracker.record_failure("n-1", now);
            assert!(delay >= previous, "backoff must never shrink");
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(16));
    }

    #[test]
    fn not_due_until_the_delay_elapses() {
        let mut tracker = BackoffTracker::new();
        let now = Instant::now();

        assert!(tracker.is_due("n-1", now), "unknown ids are always due");

        let delay = tracker.record_failure("n-1", now);
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!tracker.is_due("n-1", now));
        assert!(!tracker.is_due("n-1", now + Duration::from_millis(999)));
        assert!(tracker.is_due("n-1", now + Duration::from_secs(1)));
    }

    #[test]
    fn backoff_is_tracked_per_notification() {
        let mut tracker = BackoffTracker::new();
        let now = Instant::now();

        tracker.record_failure("stuck", now);
        tracker.record_failure("stuck", now + Duration::from_secs(1));

        // A different notification is unaffected by the stuck one.
        assert!(tracker.is_due("fresh", now));
        assert_eq!(tracker.record_failure("fresh", now), Duration::from_secs(1));
    }

    #[test]
    fn success_retires_the_entry_and_resets_the_schedule() {
        let mut tracker = BackoffTracker::new();
        let now = Instant::now();

        tracker.record_failure("n-1", now);
        tracker.record_failure("n-1", now + Duration::from_secs(1));
        assert_eq!(tracker.tracked(), 1);

        tracker.clear("n-1");
        assert_eq!(tracker.tracked(), 0);
        assert!(tracker.is_due("n-1", now));

        // A later failure starts over at the initial delay.
        assert_eq!(
            tracker.record_failure("n-1", now + Duration::from_secs(30)),
            Duration::from_secs(1)
        );
    }
}
