//! Loading workflow templates from YAML at startup.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{test_config, ScriptedTransport, SETTLE};
use orchestration_core::workflow::DefinitionError;
use orchestration_core::{
    AgentTransport, AgentType, ErrorPolicy, ExecutionStatus, Orchestrator, OrchestratorError, Variables,
};

fn shipped_templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("workflows")
}

#[tokio::test]
async fn test_shipped_templates_load_and_run() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut config = test_config();
    config.workflows.definitions_dir = Some(shipped_templates());

    let orch = Orchestrator::from_config(&config, Arc::clone(&transport) as Arc<dyn AgentTransport>).unwrap();
    let catalog = orch.engine().catalog();
    assert!(catalog.contains("APPLICATION"));
    assert!(catalog.contains("POST_INTERVIEW"));

    let offer = catalog.get("OFFER_REVIEW").unwrap();
    assert_eq!(offer.on_error, ErrorPolicy::Continue);
    assert_eq!(offer.max_duration_ms, 600_000);
    assert_eq!(offer.get_step("offerNegotiation").unwrap().retry_attempts, Some(1));

    orch.start();
    let id = orch.trigger("OFFER_REVIEW", "user-1", Variables::new()).await.unwrap();
    let execution = orch.wait_until_settled(&id, SETTLE).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(transport.calls_to(AgentType::OfferNegotiation), 1);

    let negotiation = transport.first_call(AgentType::OfferNegotiation).unwrap();
    assert_eq!(negotiation.action, "draft_counter");

    orch.shutdown().await;
}

#[test]
fn test_cyclic_template_is_rejected_before_any_execution() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("loop.yaml"),
        r"
type: LOOP
name: Mutual dependency
steps:
  - id: a
    agent: resume_score
    action: score
    dependsOn: [b]
  - id: b
    agent: ats_optimizer
    action: optimize
    dependsOn: [a]
",
    )
    .unwrap();

    let mut config = test_config();
    config.workflows.definitions_dir = Some(dir.path().to_path_buf());
    let transport: Arc<dyn AgentTransport> = Arc::new(ScriptedTransport::new());

    let err = Orchestrator::from_config(&config, transport).unwrap_err();
    match err {
        OrchestratorError::Definition(DefinitionError::Cycle { workflow, cycle }) => {
            assert_eq!(workflow, "LOOP");
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected a cycle error, got {other}"),
    }
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("dangling.yml"),
        r"
type: DANGLING
name: Dangling dependency
steps:
  - id: letter
    agent: cover_letter
    action: generate
    dependsOn: [match]
",
    )
    .unwrap();

    let mut config = test_config();
    config.workflows.builtin = false;
    config.workflows.definitions_dir = Some(dir.path().to_path_buf());
    let transport: Arc<dyn AgentTransport> = Arc::new(ScriptedTransport::new());

    let err = Orchestrator::from_config(&config, transport).unwrap_err();
    assert_eq!(err.code(), "DEFINITION_ERROR");
    assert!(err.to_string().contains("match"));
}
