//! Agent types, request/response envelopes and per-agent configuration.
//!
//! Every remote capability is a variant of the closed [`AgentType`]
//! enumeration. Dispatch parameters come from an [`AgentConfigTable`]
//! built once at startup and never mutated afterwards.

pub mod client;
pub mod transport;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::config::AgentOverride;

pub use client::AgentClient;
pub use transport::{AgentReply, AgentTransport, HttpAgentTransport};

/// Remote agent capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    JobDiscovery,
    JobMatch,
    JobAlert,
    ResumeParser,
    ResumeTailor,
    ResumeScore,
    AtsOptimizer,
    CoverLetter,
    ApplicationQuestions,
    ApplicationTracker,
    FollowUpEmail,
    ThankYouNote,
    InterviewPrep,
    MockInterview,
    InterviewFeedback,
    CompanyResearch,
    SalaryInsights,
    OfferNegotiation,
    SkillGapAnalysis,
    LearningPath,
    CareerCoach,
    NetworkingOutreach,
    LinkedinOptimizer,
    PortfolioReview,
    PersonalBrand,
    ReferenceCheck,
}

impl AgentType {
    /// Every agent kind, in declaration order.
    pub const ALL: [Self; 26] = [
        Self::JobDiscovery,
        Self::JobMatch,
        Self::JobAlert,
        Self::ResumeParser,
        Self::ResumeTailor,
        Self::ResumeScore,
        Self::AtsOptimizer,
        Self::CoverLetter,
        Self::ApplicationQuestions,
        Self::ApplicationTracker,
        Self::FollowUpEmail,
        Self::ThankYouNote,
        Self::InterviewPrep,
        Self::MockInterview,
        Self::InterviewFeedback,
        Self::CompanyResearch,
        Self::SalaryInsights,
        Self::OfferNegotiation,
        Self::SkillGapAnalysis,
        Self::LearningPath,
        Self::CareerCoach,
        Self::NetworkingOutreach,
        Self::LinkedinOptimizer,
        Self::PortfolioReview,
        Self::PersonalBrand,
        Self::ReferenceCheck,
    ];

    /// Convert to the snake_case wire tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JobDiscovery => "job_discovery",
            Self::JobMatch => "job_match",
            Self::JobAlert => "job_alert",
            Self::ResumeParser => "resume_parser",
            Self::ResumeTailor => "resume_tailor",
            Self::ResumeScore => "resume_score",
            Self::AtsOptimizer => "ats_optimizer",
            Self::CoverLetter => "cover_letter",
            Self::ApplicationQuestions => "application_questions",
            Self::ApplicationTracker => "application_tracker",
            Self::FollowUpEmail => "follow_up_email",
            Self::ThankYouNote => "thank_you_note",
            Self::InterviewPrep => "interview_prep",
            Self::MockInterview => "mock_interview",
            Self::InterviewFeedback => "interview_feedback",
            Self::CompanyResearch => "company_research",
            Self::SalaryInsights => "salary_insights",
            Self::OfferNegotiation => "offer_negotiation",
            Self::SkillGapAnalysis => "skill_gap_analysis",
            Self::LearningPath => "learning_path",
            Self::CareerCoach => "career_coach",
            Self::NetworkingOutreach => "networking_outreach",
            Self::LinkedinOptimizer => "linkedin_optimizer",
            Self::PortfolioReview => "portfolio_review",
            Self::PersonalBrand => "personal_brand",
            Self::ReferenceCheck => "reference_check",
        }
    }

    /// Agents that generate long documents with an LLM.
    const fn is_generative(self) -> bool {
        matches!(
            self,
            Self::ResumeTailor
                | Self::CoverLetter
                | Self::InterviewPrep
                | Self::MockInterview
                | Self::CareerCoach
                | Self::LearningPath
                | Self::PersonalBrand
        )
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|agent| agent.as_str() == normalized)
            .ok_or_else(|| format!("Unknown agent type: {s}"))
    }
}

/// Priority attached to a request or a queued task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Request sent to a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub agent_type: AgentType,
    pub action: String,
    pub payload: serde_json::Value,
    pub user_id: String,
    pub correlation_id: String,
    pub priority: Priority,
    /// Per-call timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl AgentRequest {
    /// Create a request with medium priority and no timeout override.
    pub fn new(
        agent_type: AgentType,
        action: impl Into<String>,
        payload: serde_json::Value,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_type,
            action: action.into(),
            payload,
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
            priority: Priority::default(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

/// Response from a remote agent.
///
/// Business-level failures arrive as `success: false` with `error` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub agent_type: AgentType,
    pub execution_time_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Dispatch parameters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the agent service.
    pub endpoint: String,
    /// Default call timeout in milliseconds.
    pub timeout_ms: u64,
    /// In-place retry budget for a step calling this agent.
    pub retry_attempts: u32,
    pub breaker: BreakerConfig,
}

impl AgentConfig {
    /// Built-in defaults for an agent kind.
    #[must_use]
    pub fn defaults_for(agent: AgentType, base_url: &str) -> Self {
        let timeout_ms = if agent.is_generative() { 60_000 } else { 15_000 };
        Self {
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), agent.as_str()),
            timeout_ms,
            retry_attempts: 2,
            breaker: BreakerConfig::default(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn apply(&mut self, o: &AgentOverride) {
        if let Some(endpoint) = &o.endpoint {
            self.endpoint.clone_from(endpoint);
        }
        if let Some(v) = o.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = o.retry_attempts {
            self.retry_attempts = v;
        }
        if let Some(v) = o.error_threshold_percentage {
            self.breaker.error_threshold_percentage = v;
        }
        if let Some(v) = o.reset_timeout_ms {
            self.breaker.reset_timeout_ms = v;
        }
        if let Some(v) = o.volume_threshold {
            self.breaker.volume_threshold = v;
        }
        if let Some(v) = o.rolling_window_ms {
            self.breaker.rolling_window_ms = v;
        }
    }
}

/// Type-to-config lookup table covering every [`AgentType`].
#[derive(Debug, Clone)]
pub struct AgentConfigTable {
    configs: HashMap<AgentType, AgentConfig>,
}

impl AgentConfigTable {
    /// Defaults for every agent under `base_url`.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        let configs = AgentType::ALL
            .into_iter()
            .map(|agent| (agent, AgentConfig::defaults_for(agent, base_url)))
            .collect();
        Self { configs }
    }

    /// Defaults plus configured overrides. Unknown agent tags are ignored
    /// with a warning.
    #[must_use]
    pub fn from_overrides(base_url: &str, overrides: &HashMap<String, AgentOverride>) -> Self {
        let mut table = Self::with_base_url(base_url);
        for (tag, o) in overrides {
            match tag.parse::<AgentType>() {
                Ok(agent) => table.override_with(agent, o),
                Err(e) => tracing::warn!(agent = %tag, error = %e, "Ignoring override for unknown agent"),
            }
        }
        table
    }

    /// Replace one agent's configuration.
    #[must_use]
    pub fn with_config(mut self, agent: AgentType, config: AgentConfig) -> Self {
        self.configs.insert(agent, config);
        self
    }

    fn override_with(&mut self, agent: AgentType, o: &AgentOverride) {
        if let Some(config) = self.configs.get_mut(&agent) {
            config.apply(o);
        }
    }

    /// Configuration for an agent. Always present.
    #[must_use]
    pub fn get(&self, agent: AgentType) -> &AgentConfig {
        &self.configs[&agent]
    }
}

impl Default for AgentConfigTable {
    fn default() -> Self {
        Self::with_base_url(crate::config::DEFAULT_AGENT_BASE_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_round_trips_through_str() {
        for agent in AgentType::ALL {
            assert_eq!(agent.as_str().parse::<AgentType>().unwrap(), agent);
        }
        assert_eq!("Cover-Letter".parse::<AgentType>().unwrap(), AgentType::CoverLetter);
        assert!("teleport".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_agent_type_serde_tag() {
        let json = serde_json::to_value(AgentType::SkillGapAnalysis).unwrap();
        assert_eq!(json, "skill_gap_analysis");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_config_table_covers_every_agent() {
        let table = AgentConfigTable::with_base_url("http://agents.internal/");
        for agent in AgentType::ALL {
            let config = table.get(agent);
            assert_eq!(
                config.endpoint,
                format!("http://agents.internal/{}", agent.as_str())
            );
        }
        assert_eq!(table.get(AgentType::CoverLetter).timeout_ms, 60_000);
        assert_eq!(table.get(AgentType::JobMatch).timeout_ms, 15_000);
    }

    #[test]
    fn test_config_table_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "job_match".to_string(),
            AgentOverride {
                timeout_ms: Some(2_000),
                volume_threshold: Some(3),
                ..AgentOverride::default()
            },
        );
        overrides.insert("unknown_agent".to_string(), AgentOverride::default());

        let table = AgentConfigTable::from_overrides("http://localhost:9000", &overrides);
        let config = table.get(AgentType::JobMatch);
        assert_eq!(config.timeout_ms, 2_000);
        assert_eq!(config.breaker.volume_threshold, 3);
        assert_eq!(config.retry_attempts, 2);
    }

    #[test]
    fn test_agent_request_wire_format() {
        let request = AgentRequest::new(
            AgentType::JobMatch,
            "score",
            serde_json::json!({"jobId": "j-1"}),
            "user-1",
            "corr-1",
        )
        .with_priority(Priority::High)
        .with_timeout(500);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["agentType"], "job_match");
        assert_eq!(json["correlationId"], "corr-1");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["timeout"], 500);
    }
}
