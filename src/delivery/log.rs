//! Durable append-only record of delivery attempts.
//!
//! One JSONL line per attempt, for operators and external log tooling. The
//! record is advisory: retry decisions rest solely on the store's delivered
//! flag plus the in-memory backoff, never on this file.

use anyhow::Context as _;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Gateway confirmed the send and the row was marked delivered.
    Delivered,
    /// Gateway refused or the transport failed; retried after backoff.
    SendFailed,
    /// Gateway confirmed the send but marking the row failed. The row stays
    /// undelivered and may be delivered again, which beats losing it.
    MarkFailed,
    /// No session key for the recipient; the row stays undelivered.
    NoSession,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::SendFailed => "send_failed",
            AttemptOutcome::MarkFailed => "mark_failed",
            AttemptOutcome::NoSession => "no_session",
        }
    }

    /// Whether the notification still needs a retry after this outcome.
    pub fn needs_retry(&self) -> bool {
        !matches!(self, AttemptOutcome::Delivered)
    }
}

#[derive(Serialize)]
struct AttemptRecord<'a> {
    timestamp: String,
    notification_id: &'a str,
    agent_id: &'a str,
    outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Append-only attempt log.
pub struct AttemptLog {
    file: Mutex<File>,
}

impl AttemptLog {
    /// Open (or create) the log file for appending.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create attempt log directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open attempt log: {}", path.display()))?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one attempt record. Write failures are logged and swallowed;
    /// a broken log file must never stall delivery.
    pub fn append(
        &self,
        notification_id: &str,
        agent_id: &str,
        outcome: AttemptOutcome,
        error: Option<&str>,
    ) {
        let record = AttemptRecord {
            timestamp: Utc::now().to_rfc3339(),
            notification_id,
            agent_id,
            outcome,
            error,
        };

        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');

        match self.file.lock() {
            Ok(mut file) => {
                if let Err(error) = file.write_all(line.as_bytes()) {
                    tracing::warn!(%error, "failed to append delivery attempt record");
                }
            }
            Err(_) => {
                tracing::warn!("attempt log mutex poisoned, dropping record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_line_per_attempt() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let path = dir.path().join("attempts.jsonl");
        let log = AttemptLog::open(&path).expect("log should open");

        log.append("n-1", "a", AttemptOutcome::SendFailed, Some("boom"));
        log.append("n-1", "a", AttemptOutcome::Delivered, None);

        let raw = std::fs::read_to_string(&path).expect("log should read back");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(first["notification_id"], "n-1");
        assert_eq!(first["agent_id"], "a");
        assert_eq!(first["outcome"], "send_failed");
        assert_eq!(first["error"], "boom");

        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        assert_eq!(second["outcome"], "delivered");
        assert!(second.get("error").is_none());
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let path = dir.path().join("attempts.jsonl");

        {
            let log = AttemptLog::open(&path).unwrap();
            log.append("n-1", "a", AttemptOutcome::Delivered, None);
        }
        {
            let log = AttemptLog::open(&path).unwrap();
            log.append("n-2", "b", AttemptOutcome::Delivered, None);
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
