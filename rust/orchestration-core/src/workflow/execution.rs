//! Runtime records for one workflow run and the status rules over them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{ErrorPolicy, WorkflowDefinition};
use super::engine::DEPENDENCY_FAILED;
use crate::agent::{AgentResponse, AgentType};
use crate::error::ErrorInfo;

/// Overall execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Cancelled
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never started: blocked by a failed dependency, or the run stopped.
    Skipped,
    /// Interrupted while running.
    Cancelled,
}

impl StepStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Progress of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub agent: AgentType,
    pub optional: bool,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub retry_count: u32,
}

/// One run of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_type: String,
    pub user_id: String,
    /// Threads every agent call of this run together in logs.
    pub correlation_id: String,
    pub status: ExecutionStatus,
    /// Step records, in template declaration order.
    pub steps: Vec<StepExecution>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorInfo>,
    /// Completed step data keyed by step id.
    pub result: Option<serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowExecution {
    /// A fresh PENDING execution with one pending record per step.
    pub fn new(definition: &WorkflowDefinition, id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|step| StepExecution {
                step_id: step.id.clone(),
                agent: step.agent,
                optional: step.optional,
                status: StepStatus::Pending,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
            })
            .collect();

        let mut metadata = HashMap::new();
        metadata.insert("workflowName".to_string(), serde_json::json!(definition.name));
        metadata.insert("onError".to_string(), serde_json::json!(definition.on_error));
        metadata.insert("maxDurationMs".to_string(), serde_json::json!(definition.max_duration_ms));

        Self {
            id: id.into(),
            workflow_type: definition.workflow_type.clone(),
            user_id: user_id.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            status: ExecutionStatus::Pending,
            steps,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            metadata,
        }
    }

    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Close every open step, then settle the execution on the status
    /// derived from its steps.
    ///
    /// Steps that never ran are SKIPPED and running ones CANCELLED. Each gets
    /// an error naming why: the interruption `error`, else the dependency
    /// that did not complete, else the `halt` reason.
    pub(crate) fn finish(
        &mut self,
        definition: &WorkflowDefinition,
        interruption: Option<Interruption>,
        error: Option<ErrorInfo>,
        halt: Option<&ErrorInfo>,
    ) -> ExecutionStatus {
        let now = Utc::now();
        for index in 0..self.steps.len() {
            let status = match self.steps[index].status {
                StepStatus::Pending => StepStatus::Skipped,
                StepStatus::Running => StepStatus::Cancelled,
                _ => continue,
            };
            let reason = error
                .clone()
                .or_else(|| self.blocking_dependency(definition, index))
                .or_else(|| halt.cloned());

            let step = &mut self.steps[index];
            step.status = status;
            step.completed_at = Some(now);
            if step.error.is_none() {
                step.error = reason;
            }
        }
        let status = derive_status(definition, &self.steps, interruption);
        self.status = status;
        self.completed_at = Some(now);
        if error.is_some() {
            self.error = error;
        }
        status
    }

    fn blocking_dependency(&self, definition: &WorkflowDefinition, index: usize) -> Option<ErrorInfo> {
        let step = definition.get_step(&self.steps[index].step_id)?;
        let dependency = step
            .depends_on
            .iter()
            .find(|dep| !matches!(self.step(dep), Some(s) if s.status == StepStatus::Completed))?;
        Some(ErrorInfo::new(
            DEPENDENCY_FAILED,
            format!("Dependency '{dependency}' did not complete"),
        ))
    }
}

/// Per-run scratch state: variables plus every step's agent response.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub user_id: String,
    pub correlation_id: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub step_results: HashMap<String, AgentResponse>,
}

impl WorkflowContext {
    pub fn new(
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
        variables: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
            variables,
            step_results: HashMap::new(),
        }
    }

    /// Record a step's response; successful data is also exposed as a
    /// variable under the step id.
    pub fn record(&mut self, step_id: &str, response: AgentResponse) {
        if response.success {
            if let Some(data) = &response.data {
                self.variables.insert(step_id.to_string(), data.clone());
            }
        }
        self.step_results.insert(step_id.to_string(), response);
    }

    /// Payload sent to a step: its params, the run variables and the data of
    /// its completed dependencies.
    #[must_use]
    pub fn step_payload(&self, params: &serde_json::Value, depends_on: &[String]) -> serde_json::Value {
        let dependencies: serde_json::Map<String, serde_json::Value> = depends_on
            .iter()
            .filter_map(|id| {
                let response = self.step_results.get(id)?;
                response
                    .success
                    .then(|| (id.clone(), response.data.clone().unwrap_or_default()))
            })
            .collect();

        serde_json::json!({
            "params": params,
            "variables": self.variables,
            "dependencies": dependencies,
        })
    }
}

/// Why a run stopped before settling on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut,
}

/// Terminal status as a pure function of step statuses, the error policy
/// and any interruption.
///
/// - cancelled: CANCELLED; timed out: FAILED
/// - nothing completed: FAILED
/// - `abort` / `retry`: a required step that did not complete means FAILED,
///   otherwise PARTIAL if any step did not complete, else COMPLETED
/// - `continue`: COMPLETED if every step completed; PARTIAL if every
///   required step completed or at least one sink step completed; FAILED
///   otherwise
#[must_use]
pub fn derive_status(
    definition: &WorkflowDefinition,
    steps: &[StepExecution],
    interruption: Option<Interruption>,
) -> ExecutionStatus {
    match interruption {
        Some(Interruption::Cancelled) => return ExecutionStatus::Cancelled,
        Some(Interruption::TimedOut) => return ExecutionStatus::Failed,
        None => {}
    }

    let completed = |s: &StepExecution| s.status == StepStatus::Completed;

    if !steps.iter().any(completed) {
        return ExecutionStatus::Failed;
    }
    if steps.iter().all(completed) {
        return ExecutionStatus::Completed;
    }

    let required_ok = steps.iter().filter(|s| !s.optional).all(completed);

    match definition.on_error {
        ErrorPolicy::Abort | ErrorPolicy::Retry => {
            if required_ok {
                ExecutionStatus::Partial
            } else {
                ExecutionStatus::Failed
            }
        }
        ErrorPolicy::Continue => {
            let sink_ok = definition
                .sink_steps()
                .iter()
                .any(|sink| steps.iter().any(|s| s.step_id == sink.id && completed(s)));
            if required_ok || sink_ok {
                ExecutionStatus::Partial
            } else {
                ExecutionStatus::Failed
            }
        }
    }
}
