//! Workflow templates: a named DAG of agent steps plus an error policy.
//!
//! A template can be built in code or loaded from YAML:
//!
//! ```yaml
//! type: OFFER_REVIEW
//! name: "Offer review"
//! onError: continue
//! maxDurationMs: 600000
//! steps:
//!   - id: salary
//!     agent: salary_insights
//!     action: benchmark
//!   - id: negotiate
//!     agent: offer_negotiation
//!     action: draft_counter
//!     dependsOn: [salary]
//!     retryAttempts: 1
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentType;

/// Default wall-clock budget for one execution: 30 minutes.
pub const DEFAULT_MAX_DURATION_MS: u64 = 30 * 60 * 1000;

/// Malformed or cyclic workflow template. Raised at registration only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Workflow type must not be empty")]
    EmptyType,

    #[error("Workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("Workflow '{workflow}' declares step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("Workflow '{workflow}' step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        workflow: String,
        step: String,
        dependency: String,
    },

    #[error("Workflow '{workflow}' has a dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { workflow: String, cycle: Vec<String> },

    #[error("Workflow '{0}' must have a positive maxDurationMs")]
    ZeroMaxDuration(String),

    #[error("Invalid workflow template{}: {message}", .source_name.as_ref().map(|s| format!(" '{s}'")).unwrap_or_default())]
    Parse {
        source_name: Option<String>,
        message: String,
    },
}

/// What the engine does when a required step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Stop scheduling new steps; the execution ends FAILED.
    #[default]
    Abort,
    /// Keep going; dependents of failed steps still run.
    Continue,
    /// Re-enqueue the failed step up to its attempt budget.
    Retry,
}

impl ErrorPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    pub agent: AgentType,
    pub action: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// An optional step's failure never fails the workflow on its own.
    #[serde(default)]
    pub optional: bool,
    /// Per-call timeout; falls back to the agent's configured timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry budget; falls back to the agent's configured retry attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent: AgentType, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent,
            action: action.into(),
            params: empty_params(),
            depends_on: Vec::new(),
            optional: false,
            timeout_ms: None,
            retry_attempts: None,
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }
}

fn default_max_duration_ms() -> u64 {
    DEFAULT_MAX_DURATION_MS
}

/// A named workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
}

impl WorkflowDefinition {
    /// An empty template with the default policy and duration.
    pub fn new(workflow_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            on_error: ErrorPolicy::default(),
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    #[must_use]
    pub fn max_duration_ms(mut self, max_duration_ms: u64) -> Self {
        self.max_duration_ms = max_duration_ms;
        self
    }

    #[must_use]
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps no other step depends on, in declaration order.
    #[must_use]
    pub fn sink_steps(&self) -> Vec<&WorkflowStep> {
        let depended: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        self.steps
            .iter()
            .filter(|s| !depended.contains(s.id.as_str()))
            .collect()
    }

    /// Check the template is well-formed and its step graph is acyclic.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.workflow_type.trim().is_empty() {
            return Err(DefinitionError::EmptyType);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.workflow_type.clone()));
        }
        if self.max_duration_ms == 0 {
            return Err(DefinitionError::ZeroMaxDuration(self.workflow_type.clone()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.workflow_type.clone(),
                    step: step.id.clone(),
                });
            }
        }

        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(DefinitionError::UnknownDependency {
                    workflow: self.workflow_type.clone(),
                    step: step.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(DefinitionError::Cycle {
                workflow: self.workflow_type.clone(),
                cycle,
            });
        }

        Ok(())
    }

    /// First dependency cycle found, closed (`[a, b, a]`).
    fn find_cycle(&self) -> Option<Vec<String>> {
        let graph: HashMap<&str, &[String]> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        self.steps.iter().find_map(|step| {
            if visited.contains(step.id.as_str()) {
                None
            } else {
                find_cycle_dfs(&graph, &step.id, &mut visited, &mut rec_stack, &mut path)
            }
        })
    }
}

/// DFS helper for cycle detection.
fn find_cycle_dfs<'a>(
    graph: &HashMap<&'a str, &'a [String]>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for neighbor in graph.get(node).copied().unwrap_or_default() {
        let neighbor = neighbor.as_str();
        if rec_stack.contains(neighbor) {
            let start = path.iter().position(|p| *p == neighbor).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(neighbor.to_string());
            return Some(cycle);
        }
        if !visited.contains(neighbor) {
            if let Some(cycle) = find_cycle_dfs(graph, neighbor, visited, rec_stack, path) {
                return Some(cycle);
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application() -> WorkflowDefinition {
        WorkflowDefinition::new("APPLICATION", "Apply")
            .step(WorkflowStep::new("match", AgentType::JobMatch, "score"))
            .step(WorkflowStep::new("tailor", AgentType::ResumeTailor, "tailor").depends_on(["match"]))
            .step(WorkflowStep::new("letter", AgentType::CoverLetter, "write").depends_on(["match"]))
    }

    #[test]
    fn test_valid_definition() {
        let def = application();
        assert!(def.validate().is_ok());
        let sinks: Vec<_> = def.sink_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(sinks, vec!["tailor", "letter"]);
    }

    #[test]
    fn test_two_step_cycle_rejected() {
        let def = WorkflowDefinition::new("LOOP", "Loop")
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["b"]))
            .step(WorkflowStep::new("b", AgentType::JobMatch, "y").depends_on(["a"]));

        match def.validate() {
            Err(DefinitionError::Cycle { workflow, cycle }) => {
                assert_eq!(workflow, "LOOP");
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("Expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = WorkflowDefinition::new("SELF", "Self")
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["a"]));
        let err = def.validate().unwrap_err();
        assert_eq!(err.to_string(), "Workflow 'SELF' has a dependency cycle: a -> a");
    }

    #[test]
    fn test_long_cycle_behind_valid_prefix() {
        let def = WorkflowDefinition::new("DEEP", "Deep")
            .step(WorkflowStep::new("root", AgentType::JobDiscovery, "find"))
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["root", "c"]))
            .step(WorkflowStep::new("b", AgentType::JobMatch, "y").depends_on(["a"]))
            .step(WorkflowStep::new("c", AgentType::JobMatch, "z").depends_on(["b"]));
        assert!(matches!(def.validate(), Err(DefinitionError::Cycle { .. })));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let def = WorkflowDefinition::new("DIAMOND", "Diamond")
            .step(WorkflowStep::new("a", AgentType::JobDiscovery, "find"))
            .step(WorkflowStep::new("b", AgentType::JobMatch, "x").depends_on(["a"]))
            .step(WorkflowStep::new("c", AgentType::CompanyResearch, "y").depends_on(["a"]))
            .step(WorkflowStep::new("d", AgentType::CoverLetter, "z").depends_on(["b", "c"]));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_malformed_definitions() {
        assert_eq!(
            WorkflowDefinition::new(" ", "Blank").validate(),
            Err(DefinitionError::EmptyType)
        );
        assert_eq!(
            WorkflowDefinition::new("EMPTY", "Empty").validate(),
            Err(DefinitionError::NoSteps("EMPTY".into()))
        );

        let dup = WorkflowDefinition::new("DUP", "Dup")
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x"))
            .step(WorkflowStep::new("a", AgentType::JobMatch, "y"));
        assert!(matches!(dup.validate(), Err(DefinitionError::DuplicateStep { .. })));

        let dangling = WorkflowDefinition::new("DANGLING", "Dangling")
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["ghost"]));
        assert!(matches!(
            dangling.validate(),
            Err(DefinitionError::UnknownDependency { ref dependency, .. }) if dependency == "ghost"
        ));

        let zero = application().max_duration_ms(0);
        assert!(matches!(zero.validate(), Err(DefinitionError::ZeroMaxDuration(_))));
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r"
type: OFFER_REVIEW
name: Offer review
onError: continue
steps:
  - id: salary
    agent: salary_insights
    action: benchmark
  - id: negotiate
    agent: offer_negotiation
    action: draft_counter
    dependsOn: [salary]
    optional: true
    timeoutMs: 5000
";
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.on_error, ErrorPolicy::Continue);
        assert_eq!(def.max_duration_ms, DEFAULT_MAX_DURATION_MS);
        let negotiate = def.get_step("negotiate").unwrap();
        assert!(negotiate.optional);
        assert_eq!(negotiate.timeout_ms, Some(5_000));
        assert_eq!(negotiate.depends_on, vec!["salary"]);
        assert!(negotiate.params.as_object().unwrap().is_empty());
    }
}
