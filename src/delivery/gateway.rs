//! Session delivery gateway: the external call that injects a notification
//! into an agent's session.
//!
//! The daemon treats the gateway as a black box: a request keyed by an
//! opaque session key, carrying a text payload, answering ok-or-error.

use crate::config::GatewayConfig;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery transport errors. All variants are retryable from the daemon's
/// point of view.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("gateway rejected delivery: {0}")]
    Rejected(String),

    #[error("gateway request timed out")]
    Timeout,
}

/// A request/response delivery channel to agent sessions.
pub trait SessionGateway: Send + Sync {
    /// Deliver `text` to the session identified by `session_key`. Returns
    /// only once the gateway has confirmed or refused the delivery.
    fn deliver(
        &self,
        session_key: &str,
        agent_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// HTTP implementation of [`SessionGateway`].
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct DeliverRequest<'a> {
    session_key: &'a str,
    agent_id: &'a str,
    message: &'a str,
}

// Only model what we need from the gateway's reply.
#[derive(Deserialize)]
struct DeliverResponse {
    #[serde(default)]
    ok: bool,
    error: Option<String>,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("hardcoded reqwest client config");

        Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
        }
    }
}

impl SessionGateway for HttpGateway {
    async fn deliver(
        &self,
        session_key: &str,
        agent_id: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        let mut request = self.client.post(&self.url).json(&DeliverRequest {
            session_key,
            agent_id,
            message: text,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("http status {status}")));
        }

        let body: DeliverResponse = response
            .json()
            .await
            .map_err(|error| GatewayError::Transport(format!("invalid gateway reply: {error}")))?;

        if body.ok {
            Ok(())
        } else {
            Err(GatewayError::Rejected(
                body.error
                    .unwrap_or_else(|| "unspecified gateway error".to_string()),
            ))
        }
    }
}
