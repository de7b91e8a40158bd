//! Workflow templates and their execution.

pub mod catalog;
pub mod definition;
pub mod engine;
pub mod execution;

pub use catalog::{builtin_definitions, WorkflowCatalog};
pub use definition::{DefinitionError, ErrorPolicy, WorkflowDefinition, WorkflowStep};
pub use engine::{Variables, WorkflowEngine, AGENT_ERROR, DEPENDENCY_FAILED, WORKFLOW_HALTED};
pub use execution::{
    ExecutionStatus, StepExecution, StepStatus, WorkflowContext, WorkflowExecution,
};
