use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentType;
use crate::workflow::definition::DefinitionError;

/// Core error type for the orchestration engine.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Agent unreachable, or the transport to it errored.
    #[error("Agent '{agent}' transport failure: {message}")]
    Transport { agent: AgentType, message: String },

    /// Call short-circuited by an open breaker.
    #[error("Circuit open for agent '{agent}'")]
    CircuitOpen { agent: AgentType },

    #[error("Agent '{agent}' did not answer within {timeout_ms}ms")]
    StepTimeout { agent: AgentType, timeout_ms: u64 },

    /// Malformed or cyclic workflow template.
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Workflow execution '{execution_id}' exceeded max duration of {max_duration_ms}ms")]
    WorkflowTimeout {
        execution_id: String,
        max_duration_ms: u64,
    },

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflow(String),

    /// Backpressure: the queue is at its ceiling.
    #[error("Task queue is full ({depth}/{ceiling})")]
    QueueFull { depth: usize, ceiling: usize },

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Workflow execution '{0}' was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Stable, user-facing error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TRANSPORT_FAILURE",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::StepTimeout { .. } => "STEP_TIMEOUT",
            Self::Definition(_) => "DEFINITION_ERROR",
            Self::WorkflowTimeout { .. } => "WORKFLOW_TIMEOUT",
            Self::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::ExecutionNotFound(_) => "NOT_FOUND",
            Self::Cancelled(_) => "CANCELLED",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a step may retry after this error.
    ///
    /// Circuit-open failures are never retried in place.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::StepTimeout { .. })
    }

    /// Create a transport failure for an agent.
    pub fn transport(agent: AgentType, message: impl Into<String>) -> Self {
        Self::Transport {
            agent,
            message: message.into(),
        }
    }

    /// Convert to the serializable form exposed to status queries.
    #[must_use]
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

/// Error as exposed to callers: a stable code plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::transport(AgentType::ResumeTailor, "connection refused");
        assert_eq!(
            err.to_string(),
            "Agent 'resume_tailor' transport failure: connection refused"
        );
        assert_eq!(err.code(), "TRANSPORT_FAILURE");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestratorError::transport(AgentType::JobMatch, "boom").is_retryable());
        assert!(OrchestratorError::StepTimeout {
            agent: AgentType::JobMatch,
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!OrchestratorError::CircuitOpen {
            agent: AgentType::JobMatch
        }
        .is_retryable());
        assert!(!OrchestratorError::UnknownWorkflow("NOPE".into()).is_retryable());
    }

    #[test]
    fn test_error_info_carries_code() {
        let info = OrchestratorError::QueueFull {
            depth: 100,
            ceiling: 100,
        }
        .to_info();
        assert_eq!(info.code, "QUEUE_FULL");
        assert!(info.message.contains("100/100"));
        assert_eq!(info.to_string(), "[QUEUE_FULL] Task queue is full (100/100)");
    }
}
