//! A failing agent is isolated by its breaker without affecting others.

mod common;

use std::sync::Arc;

use common::{orchestrator, test_config, Behaviour, ScriptedTransport, SETTLE};
use orchestration_core::config::AgentOverride;
use orchestration_core::{AgentType, CircuitState, ExecutionStatus, HealthStatus, StepStatus, Variables};

#[tokio::test]
async fn test_open_circuit_short_circuits_later_workflows() {
    let transport = Arc::new(ScriptedTransport::new().script(AgentType::JobMatch, &[Behaviour::Unreachable]));
    let mut config = test_config();
    config.agents.insert(
        "job_match".to_string(),
        AgentOverride {
            retry_attempts: Some(0),
            volume_threshold: Some(2),
            error_threshold_percentage: Some(50),
            reset_timeout_ms: Some(60_000),
            ..AgentOverride::default()
        },
    );
    let orch = orchestrator(&transport, &config);
    assert_eq!(orch.agent_status(AgentType::JobMatch), HealthStatus::Unknown);

    for user in ["user-1", "user-2"] {
        let id = orch.trigger("APPLICATION", user, Variables::new()).await.unwrap();
        let execution = orch.wait_until_settled(&id, SETTLE).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.step("jobMatch").unwrap().error.as_ref().unwrap().code,
            "TRANSPORT_FAILURE"
        );
    }
    assert_eq!(transport.calls_to(AgentType::JobMatch), 2);
    assert!(orch.registry().is_open(AgentType::JobMatch));
    assert_eq!(orch.agent_status(AgentType::JobMatch), HealthStatus::Unhealthy);

    let id = orch.trigger("APPLICATION", "user-3", Variables::new()).await.unwrap();
    let execution = orch.wait_until_settled(&id, SETTLE).await.unwrap();
    let step = execution.step("jobMatch").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_ref().unwrap().code, "CIRCUIT_OPEN");
    assert_eq!(transport.calls_to(AgentType::JobMatch), 2);

    // Other agents keep working.
    let id = orch.trigger("CAREER_PLAN", "user-4", Variables::new()).await.unwrap();
    let execution = orch.wait_until_settled(&id, SETTLE).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(orch.agent_status(AgentType::CareerCoach), HealthStatus::Healthy);

    let stats = orch.agent_stats();
    assert_eq!(stats[&AgentType::JobMatch].state, CircuitState::Open);
    assert_eq!(stats[&AgentType::JobMatch].error_count, 2);
    assert!(stats[&AgentType::JobMatch].rejected_count >= 1);

    orch.reset_circuit(AgentType::JobMatch);
    let stats = orch.agent_stats();
    assert_eq!(stats[&AgentType::JobMatch].error_count, 0);
    assert_eq!(stats[&AgentType::JobMatch].success_count, 0);
    assert_eq!(orch.agent_status(AgentType::JobMatch), HealthStatus::Healthy);

    // Resetting an agent that never had a breaker is a no-op.
    orch.reset_circuit(AgentType::ReferenceCheck);
    assert_eq!(orch.agent_status(AgentType::ReferenceCheck), HealthStatus::Unknown);

    orch.shutdown().await;
}
