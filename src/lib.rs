//! Mission Control's notification core.
//!
//! Three pieces: a SQLite-backed collaboration store (tasks, messages,
//! notifications), the fan-out rule engine that decides who gets notified
//! when a message is posted, and the delivery daemon that pushes undelivered
//! notifications to agent sessions with per-notification retry backoff.

pub mod config;
pub mod daemon;
pub mod db;
pub mod delivery;
pub mod error;
pub mod messages;
pub mod notify;
pub mod roster;
pub mod tasks;

pub use config::Config;
pub use db::Db;
pub use error::{Error, Result};
pub use roster::Roster;
