//! Orchestration Core - workflow engine for remote career agents
//!
//! Runs multi-step workflows whose steps are calls to independently
//! deployed agents (job matching, resume tailoring, cover letters, ...):
//!
//! - **Circuit breakers**: one breaker per agent kind, created lazily, so a
//!   failing agent is isolated instead of dragging every workflow down
//! - **Agent client**: the single call path to agents, with per-call
//!   timeouts and breaker routing
//! - **Workflow catalog**: templates validated once (acyclic step graph) at
//!   registration, built-in or loaded from YAML
//! - **Workflow engine**: dependency-aware concurrent step scheduling with
//!   `abort` / `continue` / `retry` error policies and a wall-clock budget
//! - **Task queue**: priority tiers, a depth ceiling and a bounded worker
//!   pool with redelivery and dead-lettering
//!
//! # Architecture
//!
//! - [`config`]: configuration loading and validation
//! - [`breaker`]: circuit breaker state machine and registry
//! - [`agent`]: agent types, configuration table, transport and client
//! - [`workflow`]: definitions, catalog, execution records and engine
//! - [`queue`]: queued tasks, queue backend and worker pool
//! - [`orchestrator`]: inbound facade wiring everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orchestration_core::{AppConfig, HttpAgentTransport, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let orchestrator = Orchestrator::from_config(&config, Arc::new(HttpAgentTransport::new(None)))?;
//!     orchestrator.start();
//!
//!     let id = orchestrator.trigger("APPLICATION", "user-42", Default::default()).await?;
//!     println!("{:?}", orchestrator.get_status(&id)?.status);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod backoff;
pub mod breaker;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod workflow;

pub use agent::{
    AgentClient, AgentConfig, AgentConfigTable, AgentReply, AgentRequest, AgentResponse,
    AgentTransport, AgentType, HttpAgentTransport, Priority,
};
pub use breaker::{CircuitBreakerRegistry, CircuitState, CircuitStats, HealthStatus};
pub use config::AppConfig;
pub use error::{ErrorInfo, OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use queue::{InMemoryTaskQueue, QueuedTask, TaskQueue, TaskQueueProcessor, TaskState};
pub use workflow::{
    ErrorPolicy, ExecutionStatus, StepStatus, Variables, WorkflowCatalog, WorkflowDefinition,
    WorkflowEngine, WorkflowExecution, WorkflowStep,
};
