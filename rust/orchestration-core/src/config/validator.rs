//! Configuration validation.
//!
//! Rejects unusable settings at startup with actionable messages instead of
//! letting them surface as stalled workers or breakers that never trip.

use super::error::{ConfigResult, ConfigurationError};
use super::{AgentOverride, AppConfig};
use crate::agent::AgentType;

/// Configuration validator.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration, reporting every
    /// problem at once.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        Self::validate_workers(config, &mut errors);
        Self::validate_engine(config, &mut errors);

        let mut tags: Vec<_> = config.agents.keys().collect();
        tags.sort();
        for tag in tags {
            Self::validate_agent_override(tag, &config.agents[tag], &mut errors);
        }

        if !matches!(config.logging.format.as_str(), "pretty" | "json") {
            errors.push(ConfigurationError::invalid(
                "logging.format",
                format!("'{}' is not supported", config.logging.format),
                "use 'pretty' or 'json'",
            ));
        }

        ConfigurationError::collect(errors).map_or(Ok(()), Err)
    }

    fn validate_workers(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        let workers = &config.workers;

        for (key, value) in [
            ("workers.max_concurrent_workers", workers.max_concurrent_workers),
            ("workers.queue_depth_ceiling", workers.queue_depth_ceiling),
            ("workers.retained_tasks", workers.retained_tasks),
            ("workers.dead_letter_capacity", workers.dead_letter_capacity),
        ] {
            if value == 0 {
                errors.push(ConfigurationError::invalid(key, "must be at least 1", "use a positive number"));
            }
        }

        if workers.task_retry_base_ms > workers.task_retry_max_ms {
            errors.push(ConfigurationError::conflict(
                "workers.task_retry_base_ms",
                "workers.task_retry_max_ms",
                format!(
                    "base delay {}ms exceeds the {}ms cap",
                    workers.task_retry_base_ms, workers.task_retry_max_ms
                ),
            ));
        }
    }

    fn validate_engine(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        let engine = &config.engine;

        if engine.engine_concurrency == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.engine_concurrency",
                "must be at least 1",
                "allow at least one agent call in flight",
            ));
        }

        if engine.retained_executions == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.retained_executions",
                "must be at least 1",
                "keep at least the latest settled execution queryable",
            ));
        }

        if engine.execution_ttl_ms == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.execution_ttl_ms",
                "must be at least 1",
                "settled executions need to outlive the status query that follows them",
            ));
        }

        if engine.step_retry_base_ms > engine.step_retry_max_ms {
            errors.push(ConfigurationError::conflict(
                "engine.step_retry_base_ms",
                "engine.step_retry_max_ms",
                format!(
                    "base delay {}ms exceeds the {}ms cap",
                    engine.step_retry_base_ms, engine.step_retry_max_ms
                ),
            ));
        }
    }

    /// Validate one `agents.<tag>` override.
    pub fn validate_agent_override(
        tag: &str,
        o: &AgentOverride,
        errors: &mut Vec<ConfigurationError>,
    ) {
        if tag.parse::<AgentType>().is_err() {
            errors.push(ConfigurationError::UnknownAgent { tag: tag.to_string() });
            return;
        }
        let key = |field: &str| format!("agents.{tag}.{field}");

        if let Some(pct) = o.error_threshold_percentage {
            if pct == 0 || pct > 100 {
                errors.push(ConfigurationError::invalid(
                    key("error_threshold_percentage"),
                    format!("{pct} is outside 1-100"),
                    "use a percentage between 1 and 100",
                ));
            }
        }

        if o.volume_threshold == Some(0) {
            errors.push(ConfigurationError::invalid(
                key("volume_threshold"),
                "must be at least 1",
                "a breaker needs at least one call in the window before it can trip",
            ));
        }

        if o.timeout_ms == Some(0) {
            errors.push(ConfigurationError::invalid(
                key("timeout_ms"),
                "must be at least 1",
                "remove the override to use the agent's default timeout",
            ));
        }

        if o.rolling_window_ms == Some(0) {
            errors.push(ConfigurationError::invalid(
                key("rolling_window_ms"),
                "must be at least 1",
                "remove the override to use the default 10s window",
            ));
        }

        if let Some(endpoint) = &o.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errors.push(ConfigurationError::invalid(
                    key("endpoint"),
                    format!("'{endpoint}' is not an http(s) URL"),
                    "use a full URL such as http://cover-letter:8080",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = AppConfig::default();
        config.workers.max_concurrent_workers = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.keys(), vec!["workers.max_concurrent_workers"]);
        assert!(err.to_string().contains("ORCHESTRATOR__WORKERS__MAX_CONCURRENT_WORKERS"));
        assert_eq!(err.count(), 1);
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = AppConfig::default();
        config.workers.queue_depth_ceiling = 0;
        config.engine.step_retry_base_ms = 90_000;
        config.logging.format = "xml".to_string();
        config.agents.insert(
            "teleporter".to_string(),
            AgentOverride::default(),
        );
        config.agents.insert(
            "job_match".to_string(),
            AgentOverride {
                error_threshold_percentage: Some(150),
                volume_threshold: Some(0),
                ..AgentOverride::default()
            },
        );

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 6);
        assert_eq!(
            err.keys(),
            vec![
                "workers.queue_depth_ceiling",
                "engine.step_retry_base_ms",
                "engine.step_retry_max_ms",
                "agents.job_match.error_threshold_percentage",
                "agents.job_match.volume_threshold",
                "agents.teleporter",
                "logging.format",
            ]
        );
        assert!(err.to_string().contains("150 is outside 1-100"));
    }

    #[test]
    fn test_endpoint_must_be_http() {
        let mut errors = Vec::new();
        ConfigValidator::validate_agent_override(
            "cover_letter",
            &AgentOverride {
                endpoint: Some("cover-letter:8080".to_string()),
                ..AgentOverride::default()
            },
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keys(), vec!["agents.cover_letter.endpoint"]);
    }

    #[test]
    fn test_retention_limits_must_be_positive() {
        let mut config = AppConfig::default();
        config.engine.retained_executions = 0;
        config.workers.dead_letter_capacity = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.keys(), vec!["workers.dead_letter_capacity", "engine.retained_executions"]);
    }
}
