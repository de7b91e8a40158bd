//! Uniform call path to remote agents.
//!
//! Every call is routed through the [`CircuitBreakerRegistry`] and bounded
//! by a per-call timeout. Business failures come back as
//! `AgentResponse { success: false, .. }`; transport failures, timeouts and
//! short-circuited calls come back as distinct [`OrchestratorError`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use super::{AgentConfigTable, AgentRequest, AgentResponse, AgentTransport};
use crate::breaker::{BreakerError, CircuitBreakerRegistry};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Client used by every component that needs to reach an agent.
#[derive(Clone)]
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    registry: Arc<CircuitBreakerRegistry>,
    agents: Arc<AgentConfigTable>,
}

impl AgentClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        registry: Arc<CircuitBreakerRegistry>,
        agents: Arc<AgentConfigTable>,
    ) -> Self {
        Self {
            transport,
            registry,
            agents,
        }
    }

    /// The breaker registry calls are routed through.
    #[must_use]
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn agents(&self) -> &AgentConfigTable {
        &self.agents
    }

    /// Invoke an agent.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::CircuitOpen`] when the agent's breaker is open
    ///   (the transport is not touched)
    /// - [`OrchestratorError::StepTimeout`] when the call exceeded its timeout
    /// - [`OrchestratorError::Transport`] when the agent could not be reached
    pub async fn invoke(&self, request: AgentRequest) -> OrchestratorResult<AgentResponse> {
        let agent = request.agent_type;
        let span = tracing::info_span!(
            "agent_call",
            agent = %agent,
            action = %request.action,
            correlation_id = %request.correlation_id,
            user_id = %request.user_id,
        );

        async move {
            let config = self.agents.get(agent);
            let timeout_ms = request.timeout.unwrap_or(config.timeout_ms);
            let started = Instant::now();

            tracing::debug!(timeout_ms, priority = %request.priority, "Invoking agent");

            let result = self
                .registry
                .execute(agent, || async {
                    match tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        self.transport.send(config, &request),
                    )
                    .await
                    {
                        Ok(reply) => reply,
                        Err(_) => Err(OrchestratorError::StepTimeout { agent, timeout_ms }),
                    }
                })
                .await;

            let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(reply) => {
                    if reply.success {
                        tracing::info!(execution_time_ms, "Agent call succeeded");
                    } else {
                        tracing::warn!(
                            execution_time_ms,
                            error = reply.error.as_deref().unwrap_or("unspecified"),
                            "Agent reported failure"
                        );
                    }
                    Ok(AgentResponse {
                        success: reply.success,
                        data: reply.data,
                        error: reply.error,
                        agent_type: agent,
                        execution_time_ms,
                        timestamp: chrono::Utc::now(),
                    })
                }
                Err(BreakerError::Open) => {
                    tracing::warn!("Agent call short-circuited, circuit open");
                    Err(OrchestratorError::CircuitOpen { agent })
                }
                Err(BreakerError::Inner(e)) => {
                    tracing::warn!(execution_time_ms, error = %e, code = e.code(), "Agent call failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::{AgentConfig, AgentReply, AgentType};
    use crate::breaker::{BreakerConfig, HealthStatus};

    /// Transport answering every call with a fixed behaviour.
    struct FixedTransport {
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    enum Behaviour {
        Succeed,
        Reject,
        Fail,
        Hang,
    }

    #[async_trait]
    impl AgentTransport for FixedTransport {
        async fn send(&self, _config: &AgentConfig, request: &AgentRequest) -> OrchestratorResult<AgentReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(AgentReply::ok(serde_json::json!({"echo": request.action}))),
                Behaviour::Reject => Ok(AgentReply::rejected("bad input")),
                Behaviour::Fail => Err(OrchestratorError::transport(request.agent_type, "connection refused")),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(AgentReply::default())
                }
            }
        }
    }

    fn client(behaviour: Behaviour) -> (AgentClient, Arc<FixedTransport>) {
        let transport = Arc::new(FixedTransport {
            behaviour,
            calls: AtomicU32::new(0),
        });
        let mut config = AgentConfig::defaults_for(AgentType::JobMatch, "http://agents");
        config.breaker = BreakerConfig {
            error_threshold_percentage: 50,
            reset_timeout_ms: 60_000,
            volume_threshold: 2,
            rolling_window_ms: 60_000,
        };
        let agents = Arc::new(AgentConfigTable::default().with_config(AgentType::JobMatch, config));
        let registry = Arc::new(CircuitBreakerRegistry::new(Arc::clone(&agents)));
        let client = AgentClient::new(Arc::clone(&transport) as Arc<dyn AgentTransport>, registry, agents);
        (client, transport)
    }

    fn request() -> AgentRequest {
        AgentRequest::new(
            AgentType::JobMatch,
            "score",
            serde_json::json!({}),
            "user-1",
            "corr-1",
        )
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let (client, _) = client(Behaviour::Succeed);
        let response = client.invoke(request()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.agent_type, AgentType::JobMatch);
        assert_eq!(response.data.unwrap()["echo"], "score");
        assert_eq!(client.registry().status(AgentType::JobMatch), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_business_failure_is_captured_not_thrown() {
        let (client, _) = client(Behaviour::Reject);
        let response = client.invoke(request()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("bad input"));
        assert_eq!(client.registry().stats(AgentType::JobMatch).unwrap().error_count, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_trips_breaker_then_short_circuits() {
        let (client, transport) = client(Behaviour::Fail);

        for _ in 0..2 {
            let err = client.invoke(request()).await.unwrap_err();
            assert_eq!(err.code(), "TRANSPORT_FAILURE");
        }
        let err = client.invoke(request()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { agent: AgentType::JobMatch }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_timeout_override() {
        let (client, _) = client(Behaviour::Hang);
        let err = client.invoke(request().with_timeout(20)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StepTimeout { timeout_ms: 20, .. }));
        assert_eq!(client.registry().stats(AgentType::JobMatch).unwrap().error_count, 1);
    }
}
