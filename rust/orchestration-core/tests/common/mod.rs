//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use orchestration_core::{
    AgentConfig, AgentReply, AgentRequest, AgentTransport, AgentType, AppConfig, Orchestrator,
    OrchestratorError, OrchestratorResult, WorkflowCatalog,
};

/// How an agent answers one call.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    Succeed,
    /// `success: false` from the agent.
    Reject,
    /// Transport failure.
    Unreachable,
    /// Never answers within any reasonable timeout.
    Stall,
}

/// One recorded agent call.
#[derive(Debug, Clone)]
pub struct Call {
    pub agent: AgentType,
    pub action: String,
    pub user_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// In-memory agent fleet. Each agent follows a script of behaviours, the
/// last one repeating; unscripted agents succeed.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<AgentType, Vec<Behaviour>>>,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(self, agent: AgentType, behaviours: &[Behaviour]) -> Self {
        self.scripts.lock().insert(agent, behaviours.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, agent: AgentType) -> usize {
        self.calls.lock().iter().filter(|c| c.agent == agent).count()
    }

    pub fn first_call(&self, agent: AgentType) -> Option<Call> {
        self.calls.lock().iter().find(|c| c.agent == agent).cloned()
    }

    fn next_behaviour(&self, agent: AgentType) -> Behaviour {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&agent) {
            Some(script) if script.len() > 1 => script.remove(0),
            Some(script) => script.first().copied().unwrap_or(Behaviour::Succeed),
            None => Behaviour::Succeed,
        }
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn send(&self, _config: &AgentConfig, request: &AgentRequest) -> OrchestratorResult<AgentReply> {
        let behaviour = self.next_behaviour(request.agent_type);
        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = match behaviour {
            Behaviour::Succeed => Ok(AgentReply::ok(serde_json::json!({
                "agent": request.agent_type.as_str(),
                "action": request.action,
                "input": request.payload,
            }))),
            Behaviour::Reject => Ok(AgentReply::rejected(format!("{} declined", request.agent_type))),
            Behaviour::Unreachable => Err(OrchestratorError::transport(
                request.agent_type,
                "connection refused",
            )),
            Behaviour::Stall => {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(AgentReply::ok(serde_json::Value::Null))
            }
        };

        self.calls.lock().push(Call {
            agent: request.agent_type,
            action: request.action.clone(),
            user_id: request.user_id.clone(),
            started,
            finished: Instant::now(),
        });
        reply
    }
}

/// Configuration with fast retries for tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.workers.max_concurrent_workers = 4;
    config.workers.task_retry_base_ms = 1;
    config.workers.task_retry_max_ms = 10;
    config.engine.step_retry_base_ms = 1;
    config.engine.step_retry_max_ms = 10;
    config
}

/// A started orchestrator over the built-in catalog.
pub fn orchestrator(transport: &Arc<ScriptedTransport>, config: &AppConfig) -> Orchestrator {
    orchestrator_with(transport, config, WorkflowCatalog::with_builtins())
}

pub fn orchestrator_with(
    transport: &Arc<ScriptedTransport>,
    config: &AppConfig,
    catalog: WorkflowCatalog,
) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, catalog, Arc::clone(transport) as Arc<dyn AgentTransport>);
    orchestrator.start();
    orchestrator
}

pub const SETTLE: Duration = Duration::from_secs(5);
