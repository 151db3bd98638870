//! Daemon configuration loaded from config.toml.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
///
/// Every section has defaults so a missing config file yields a runnable
/// (if roster-less) daemon. The agent roster is the one part operators must
/// fill in for deliveries to happen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub gateway: GatewayConfig,
    pub delivery_log: DeliveryLogConfig,
    /// Known agents: stable id, display name, gateway session key.
    pub agents: Vec<AgentEntry>,
}

/// Polling daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Seconds between polling cycles.
    pub poll_interval_secs: u64,
    /// Override for the instance directory (database, PID file, logs).
    pub data_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            data_dir: None,
        }
    }
}

/// Session delivery gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Endpoint the daemon POSTs delivery payloads to.
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Per-attempt request timeout in seconds. Keeps one stuck recipient
    /// from blocking the rest of the cycle.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18789/v1/session/send".to_string(),
            token: None,
            request_timeout_secs: 10,
        }
    }
}

/// Durable delivery attempt log settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryLogConfig {
    /// Override for the attempt log path. Defaults to
    /// `<data_dir>/delivery-attempts.jsonl`.
    pub path: Option<PathBuf>,
}

/// One roster entry from `[[agents]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentEntry {
    /// Stable agent id used across tasks, messages, and notifications.
    pub id: String,
    /// Display name used when formatting delivery payloads.
    pub name: Option<String>,
    /// Opaque gateway routing key. An entry without one is polled but its
    /// notifications stay undelivered.
    pub session_key: Option<String>,
}

impl Config {
    /// Load configuration from an explicit path, or from
    /// `<instance_dir>/config.toml` when none is given. A missing default
    /// file is not an error; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_instance_dir().join("config.toml"), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    /// Default instance directory for the database, PID file, and logs.
    pub fn default_instance_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("missionctl")
    }

    /// Effective instance directory after config overrides.
    pub fn data_dir(&self) -> PathBuf {
        self.daemon
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_instance_dir)
    }

    /// Effective delivery attempt log path.
    pub fn delivery_log_path(&self) -> PathBuf {
        self.delivery_log
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("delivery-attempts.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = Config::default();
        assert_eq!(config.daemon.poll_interval_secs, 2);
        assert_eq!(config.gateway.request_timeout_secs, 10);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn parses_roster_and_overrides() {
        let raw = r#"
            [daemon]
            poll_interval_secs = 5

            [gateway]
            url = "http://gateway.local/send"
            token = "secret"

            [[agents]]
            id = "jarvis"
            name = "Jarvis"
            session_key = "agent:jarvis:main"

            [[agents]]
            id = "designer"
        "#;

        let config: Config = toml::from_str(raw).expect("config should parse");
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.gateway.url, "http://gateway.local/send");
        assert_eq!(config.gateway.token.as_deref(), Some("secret"));
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].session_key.as_deref(), Some("agent:jarvis:main"));
        assert!(config.agents[1].session_key.is_none());
    }

    #[test]
    fn delivery_log_path_follows_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = Some(PathBuf::from("/tmp/mc-test"));
        assert_eq!(
            config.delivery_log_path(),
            PathBuf::from("/tmp/mc-test/delivery-attempts.jsonl")
        );
    }
}
