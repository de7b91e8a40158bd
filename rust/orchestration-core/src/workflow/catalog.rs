//! Registry of validated workflow templates.
//!
//! Templates are validated when registered and are immutable afterwards;
//! the catalog is built at startup and shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::definition::{DefinitionError, ErrorPolicy, WorkflowDefinition, WorkflowStep};
use crate::agent::AgentType;

/// Validated templates keyed by workflow type.
#[derive(Debug, Default)]
pub struct WorkflowCatalog {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding the built-in job-application templates. Built-ins
    /// are validated like any other template; if they fail, the catalog is
    /// left empty and the failure logged.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        if let Err(e) = catalog.register_all(builtin_definitions()) {
            tracing::error!(error = %e, "Built-in workflow templates are invalid");
        }
        catalog
    }

    /// Validate and register a template, replacing any template of the same
    /// type.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        self.insert(definition);
        Ok(())
    }

    /// Register a batch of templates, all or nothing: if any fails
    /// validation the catalog is left unchanged. Returns the number
    /// registered.
    pub fn register_all(&mut self, definitions: Vec<WorkflowDefinition>) -> Result<usize, DefinitionError> {
        for definition in &definitions {
            definition.validate()?;
        }
        let count = definitions.len();
        for definition in definitions {
            self.insert(definition);
        }
        Ok(count)
    }

    fn insert(&mut self, definition: WorkflowDefinition) {
        let workflow_type = definition.workflow_type.clone();
        tracing::debug!(
            workflow_type = %workflow_type,
            steps = definition.steps.len(),
            on_error = %definition.on_error,
            "Registered workflow template"
        );
        if self
            .definitions
            .insert(workflow_type.clone(), Arc::new(definition))
            .is_some()
        {
            tracing::info!(workflow_type = %workflow_type, "Workflow template replaced");
        }
    }

    /// Parse one YAML template and register it. Returns its workflow type.
    pub fn load_yaml_str(&mut self, yaml: &str) -> Result<String, DefinitionError> {
        let definition = parse_yaml(yaml, None)?;
        let workflow_type = definition.workflow_type.clone();
        self.register(definition)?;
        Ok(workflow_type)
    }

    /// Register every `*.yaml` / `*.yml` file in `dir`, in file-name order.
    /// Every file is parsed and validated before any is registered, so one
    /// bad file leaves the catalog unchanged. Returns the number loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, DefinitionError> {
        let io_error = |e: std::io::Error| DefinitionError::Parse {
            source_name: Some(dir.display().to_string()),
            message: e.to_string(),
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in &paths {
            let name = path.display().to_string();
            let yaml = std::fs::read_to_string(path).map_err(|e| DefinitionError::Parse {
                source_name: Some(name.clone()),
                message: e.to_string(),
            })?;
            let definition = parse_yaml(&yaml, Some(&name))?;
            tracing::debug!(workflow_type = %definition.workflow_type, path = %name, "Parsed workflow template");
            definitions.push(definition);
        }

        self.register_all(definitions)
    }

    #[must_use]
    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Registered workflow types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn parse_yaml(yaml: &str, source_name: Option<&str>) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml::from_str(yaml).map_err(|e| DefinitionError::Parse {
        source_name: source_name.map(ToString::to_string),
        message: e.to_string(),
    })
}

/// The built-in job-application templates.
#[must_use]
pub fn builtin_definitions() -> Vec<WorkflowDefinition> {
    vec![
        WorkflowDefinition::new("APPLICATION", "Job application")
            .describe("Match a job, then tailor the resume and write a cover letter")
            .on_error(ErrorPolicy::Abort)
            .max_duration_ms(10 * 60 * 1000)
            .step(WorkflowStep::new("jobMatch", AgentType::JobMatch, "analyze_match"))
            .step(
                WorkflowStep::new("resumeTailor", AgentType::ResumeTailor, "tailor_resume")
                    .depends_on(["jobMatch"]),
            )
            .step(
                WorkflowStep::new("coverLetter", AgentType::CoverLetter, "generate")
                    .depends_on(["jobMatch"]),
            ),
        WorkflowDefinition::new("JOB_SEARCH", "Job search")
            .describe("Discover openings and enrich them with match scores and research")
            .on_error(ErrorPolicy::Continue)
            .max_duration_ms(15 * 60 * 1000)
            .step(WorkflowStep::new("jobDiscovery", AgentType::JobDiscovery, "search"))
            .step(WorkflowStep::new("jobMatch", AgentType::JobMatch, "rank").depends_on(["jobDiscovery"]))
            .step(
                WorkflowStep::new("companyResearch", AgentType::CompanyResearch, "research")
                    .depends_on(["jobDiscovery"])
                    .optional(),
            )
            .step(
                WorkflowStep::new("salaryInsights", AgentType::SalaryInsights, "estimate")
                    .depends_on(["jobDiscovery"])
                    .optional(),
            )
            .step(
                WorkflowStep::new("jobAlert", AgentType::JobAlert, "notify")
                    .depends_on(["jobMatch"])
                    .optional(),
            ),
        WorkflowDefinition::new("INTERVIEW_PREP", "Interview preparation")
            .on_error(ErrorPolicy::Continue)
            .max_duration_ms(20 * 60 * 1000)
            .step(WorkflowStep::new("companyResearch", AgentType::CompanyResearch, "research"))
            .step(
                WorkflowStep::new("interviewPrep", AgentType::InterviewPrep, "prepare")
                    .depends_on(["companyResearch"]),
            )
            .step(
                WorkflowStep::new("mockInterview", AgentType::MockInterview, "generate_questions")
                    .depends_on(["interviewPrep"])
                    .optional(),
            )
            .step(WorkflowStep::new("salaryInsights", AgentType::SalaryInsights, "estimate").optional()),
        WorkflowDefinition::new("RESUME_REFRESH", "Resume refresh")
            .on_error(ErrorPolicy::Retry)
            .max_duration_ms(10 * 60 * 1000)
            .step(WorkflowStep::new("resumeParser", AgentType::ResumeParser, "parse"))
            .step(
                WorkflowStep::new("resumeScore", AgentType::ResumeScore, "score")
                    .depends_on(["resumeParser"]),
            )
            .step(
                WorkflowStep::new("atsOptimizer", AgentType::AtsOptimizer, "optimize")
                    .depends_on(["resumeScore"]),
            )
            .step(
                WorkflowStep::new("linkedinOptimizer", AgentType::LinkedinOptimizer, "suggest")
                    .depends_on(["resumeParser"])
                    .optional(),
            ),
        WorkflowDefinition::new("CAREER_PLAN", "Career plan")
            .on_error(ErrorPolicy::Continue)
            .step(WorkflowStep::new("skillGap", AgentType::SkillGapAnalysis, "analyze"))
            .step(
                WorkflowStep::new("learningPath", AgentType::LearningPath, "plan")
                    .depends_on(["skillGap"]),
            )
            .step(
                WorkflowStep::new("careerCoach", AgentType::CareerCoach, "advise")
                    .depends_on(["skillGap", "learningPath"]),
            )
            .step(
                WorkflowStep::new("networkingOutreach", AgentType::NetworkingOutreach, "draft_messages")
                    .depends_on(["careerCoach"])
                    .optional(),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for definition in builtin_definitions() {
            definition
                .validate()
                .unwrap_or_else(|e| panic!("{} invalid: {e}", definition.workflow_type));
        }
        let catalog = WorkflowCatalog::with_builtins();
        assert_eq!(
            catalog.types(),
            vec!["APPLICATION", "CAREER_PLAN", "INTERVIEW_PREP", "JOB_SEARCH", "RESUME_REFRESH"]
        );
    }

    #[test]
    fn test_application_shape() {
        let catalog = WorkflowCatalog::with_builtins();
        let app = catalog.get("APPLICATION").unwrap();
        assert_eq!(app.steps.len(), 3);
        assert_eq!(app.on_error, ErrorPolicy::Abort);
        assert_eq!(app.get_step("coverLetter").unwrap().depends_on, vec!["jobMatch"]);
    }

    #[test]
    fn test_register_rejects_cycle_and_keeps_catalog_unchanged() {
        let mut catalog = WorkflowCatalog::new();
        let cyclic = WorkflowDefinition::new("LOOP", "Loop")
            .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["b"]))
            .step(WorkflowStep::new("b", AgentType::JobMatch, "y").depends_on(["a"]));

        assert!(matches!(catalog.register(cyclic), Err(DefinitionError::Cycle { .. })));
        assert!(!catalog.contains("LOOP"));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_register_replaces_same_type() {
        let mut catalog = WorkflowCatalog::with_builtins();
        let custom = WorkflowDefinition::new("APPLICATION", "Lean application")
            .step(WorkflowStep::new("jobMatch", AgentType::JobMatch, "analyze_match"));
        catalog.register(custom).unwrap();
        assert_eq!(catalog.get("APPLICATION").unwrap().steps.len(), 1);
        assert_eq!(catalog.len(), 5);
    }

    #[test]
    fn test_load_yaml_str_reports_parse_errors() {
        let mut catalog = WorkflowCatalog::new();
        let err = catalog.load_yaml_str("type: X\nsteps: not-a-list\n").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse { source_name: None, .. }));

        let err = catalog
            .load_yaml_str("type: X\nname: X\nsteps:\n  - id: a\n    agent: teleporter\n    action: go\n")
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid workflow template"));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("offer.yaml"),
            "type: OFFER\nname: Offer\nsteps:\n  - id: salary\n    agent: salary_insights\n    action: benchmark\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = WorkflowCatalog::new();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        assert!(catalog.contains("OFFER"));
    }

    #[test]
    fn test_load_dir_names_the_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yml"), "type: [").unwrap();

        let err = WorkflowCatalog::new().load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.yml"));
    }

    #[test]
    fn test_load_dir_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a_offer.yaml"),
            "type: OFFER\nname: Offer\nsteps:\n  - id: salary\n    agent: salary_insights\n    action: benchmark\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b_loop.yaml"),
            "type: LOOP\nname: Loop\nsteps:\n  - id: a\n    agent: job_match\n    action: x\n    dependsOn: [b]\n  - id: b\n    agent: job_match\n    action: y\n    dependsOn: [a]\n",
        )
        .unwrap();

        let mut catalog = WorkflowCatalog::with_builtins();
        let err = catalog.load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, DefinitionError::Cycle { .. }));
        assert!(!catalog.contains("OFFER"));
        assert!(!catalog.contains("LOOP"));
        assert_eq!(catalog.len(), 5);
    }

    #[test]
    fn test_register_all_validates_before_inserting() {
        let mut catalog = WorkflowCatalog::new();
        let batch = vec![
            WorkflowDefinition::new("OK", "Fine")
                .step(WorkflowStep::new("a", AgentType::JobMatch, "x")),
            WorkflowDefinition::new("BAD", "Dangling")
                .step(WorkflowStep::new("a", AgentType::JobMatch, "x").depends_on(["missing"])),
        ];
        assert!(catalog.register_all(batch).is_err());
        assert!(catalog.is_empty());

        assert_eq!(catalog.register_all(builtin_definitions()).unwrap(), 5);
        assert_eq!(catalog.len(), 5);
    }
}
