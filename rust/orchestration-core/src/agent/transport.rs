//! Transport to remote agents.
//!
//! The orchestration core never talks to the network directly; it goes
//! through an [`AgentTransport`]. [`HttpAgentTransport`] is the production
//! implementation, tests plug in scripted transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AgentConfig, AgentRequest};
use crate::error::{OrchestratorError, OrchestratorResult};

/// What an agent answered, before timing metadata is attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentReply {
    /// A successful reply carrying `data`.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A business-level failure reported by the agent.
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// One request/response exchange with a remote agent.
///
/// Implementations return `Err` only when the agent could not be reached
/// or answered with a transport-level error; an agent that answered
/// "no" returns `Ok` with `success: false`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, config: &AgentConfig, request: &AgentRequest) -> OrchestratorResult<AgentReply>;
}

/// JSON-over-HTTP transport: `POST {endpoint}/{action}`.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpAgentTransport {
    #[must_use]
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for HttpAgentTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentTransport")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send(&self, config: &AgentConfig, request: &AgentRequest) -> OrchestratorResult<AgentReply> {
        let agent = request.agent_type;
        let url = format!("{}/{}", config.endpoint.trim_end_matches('/'), request.action);

        let mut http_request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Correlation-Id", &request.correlation_id);

        if let Some(ref key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {key}"));
        }

        let response = http_request
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    OrchestratorError::transport(agent, format!("Connection failed: {e}"))
                } else {
                    OrchestratorError::transport(agent, format!("HTTP error: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::transport(
                agent,
                format!("Agent returned {status}: {error_text}"),
            ));
        }

        if !status.is_success() {
            // 4xx: the agent is up and refused this request.
            let error_text = response.text().await.unwrap_or_default();
            return Ok(AgentReply::rejected(format!("Agent returned {status}: {error_text}")));
        }

        response
            .json::<AgentReply>()
            .await
            .map_err(|e| OrchestratorError::transport(agent, format!("Invalid response body: {e}")))
    }
}
