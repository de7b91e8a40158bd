//! Inbound facade: one object wiring registry, client, engine and queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentClient, AgentConfigTable, AgentTransport, AgentType, Priority};
use crate::breaker::{CircuitBreakerRegistry, CircuitStats, HealthStatus};
use crate::config::{AppConfig, WorkflowsConfig};
use crate::error::OrchestratorResult;
use crate::queue::{DeadLetter, InMemoryTaskQueue, TaskQueue, TaskQueueProcessor, TaskState};
use crate::workflow::{
    builtin_definitions, DefinitionError, Variables, WorkflowCatalog, WorkflowEngine, WorkflowExecution,
};

/// Owns every long-lived component of one orchestrator instance.
#[derive(Debug)]
pub struct Orchestrator {
    registry: Arc<CircuitBreakerRegistry>,
    engine: Arc<WorkflowEngine>,
    processor: TaskQueueProcessor,
}

impl Orchestrator {
    /// Build from configuration, registering the catalog it describes.
    ///
    /// # Errors
    ///
    /// [`crate::OrchestratorError::Definition`] when a template fails to
    /// load or validate.
    pub fn from_config(config: &AppConfig, transport: Arc<dyn AgentTransport>) -> OrchestratorResult<Self> {
        let catalog = build_catalog(&config.workflows)?;
        Ok(Self::new(config, catalog, transport))
    }

    /// Build around an already populated catalog.
    #[must_use]
    pub fn new(config: &AppConfig, catalog: WorkflowCatalog, transport: Arc<dyn AgentTransport>) -> Self {
        let agents = Arc::new(AgentConfigTable::from_overrides(&config.agent_base_url, &config.agents));
        let registry = Arc::new(CircuitBreakerRegistry::new(Arc::clone(&agents)));
        let client = AgentClient::new(transport, Arc::clone(&registry), agents);
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(config.workers.queue_depth_ceiling));

        tracing::info!(
            workflows = ?catalog.types(),
            engine_concurrency = config.engine.engine_concurrency,
            "Orchestrator initialized"
        );

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(catalog),
            client,
            Arc::clone(&queue),
            &config.engine,
        ));
        let processor = TaskQueueProcessor::new(Arc::clone(&engine), queue, config.workers.clone());

        Self {
            registry,
            engine,
            processor,
        }
    }

    /// Start the worker pool.
    pub fn start(&self) {
        self.processor.start();
    }

    /// Stop the worker pool after in-progress executions settle.
    pub async fn shutdown(&self) {
        self.processor.shutdown().await;
    }

    /// Create and queue an execution; returns its id immediately.
    pub async fn trigger(
        &self,
        workflow_type: &str,
        user_id: &str,
        variables: Variables,
    ) -> OrchestratorResult<String> {
        self.trigger_with_priority(workflow_type, user_id, variables, Priority::default())
            .await
    }

    /// Like [`Self::trigger`]; the task state is tracked under the
    /// execution id from the moment it is queued.
    pub async fn trigger_with_priority(
        &self,
        workflow_type: &str,
        user_id: &str,
        variables: Variables,
        priority: Priority,
    ) -> OrchestratorResult<String> {
        let task = self.engine.prepare(workflow_type, user_id, variables, priority)?;
        let execution_id = task.id.clone();
        if let Err(e) = self.processor.submit(task).await {
            self.engine.discard(&execution_id);
            return Err(e);
        }
        Ok(execution_id)
    }

    /// Enqueue a raw trigger; the execution is created when a worker picks
    /// it up and carries the returned task id.
    pub async fn enqueue(
        &self,
        workflow_type: &str,
        user_id: &str,
        priority: Priority,
        payload: serde_json::Value,
    ) -> OrchestratorResult<String> {
        self.processor
            .enqueue(workflow_type, user_id, priority, payload)
            .await
    }

    pub fn get_status(&self, execution_id: &str) -> OrchestratorResult<WorkflowExecution> {
        self.engine.get_status(execution_id)
    }

    pub fn cancel(&self, execution_id: &str) -> OrchestratorResult<WorkflowExecution> {
        self.engine.cancel(execution_id)
    }

    /// Wait for an execution to settle, up to `timeout`.
    pub async fn wait_until_settled(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> OrchestratorResult<WorkflowExecution> {
        self.engine.wait_until_settled(execution_id, timeout).await
    }

    #[must_use]
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.processor.task_state(task_id)
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.processor.dead_letters()
    }

    #[must_use]
    pub fn agent_status(&self, agent: AgentType) -> HealthStatus {
        self.registry.status(agent)
    }

    #[must_use]
    pub fn agent_stats(&self) -> BTreeMap<AgentType, CircuitStats> {
        self.registry.all_stats()
    }

    pub fn reset_circuit(&self, agent: AgentType) {
        self.registry.reset_circuit(agent);
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }
}

/// Built-in templates (unless disabled) plus every YAML template in the
/// configured directory.
pub fn build_catalog(config: &WorkflowsConfig) -> Result<WorkflowCatalog, DefinitionError> {
    let mut catalog = WorkflowCatalog::new();
    if config.builtin {
        catalog.register_all(builtin_definitions())?;
    }

    if let Some(dir) = &config.definitions_dir {
        let loaded = catalog.load_dir(dir)?;
        tracing::info!(dir = %dir.display(), loaded, "Workflow templates loaded");
    }

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_catalog_without_builtins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("offer.yml"),
            "type: OFFER_REVIEW\nname: Offer review\nsteps:\n  - id: salary\n    agent: salary_insights\n    action: benchmark\n",
        )
        .unwrap();

        let config = WorkflowsConfig {
            builtin: false,
            definitions_dir: Some(dir.path().to_path_buf()),
        };
        let catalog = build_catalog(&config).unwrap();
        assert_eq!(catalog.types(), vec!["OFFER_REVIEW"]);
    }

    #[test]
    fn test_build_catalog_defaults_to_builtins() {
        let catalog = build_catalog(&WorkflowsConfig::default()).unwrap();
        assert_eq!(catalog.len(), 5);
    }
}
