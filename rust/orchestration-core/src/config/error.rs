//! Configuration errors, each tied to the setting that caused it.
//!
//! Every setting has a dotted key (`workers.queue_depth_ceiling`) and an
//! environment variable derived from it
//! (`ORCHESTRATOR__WORKERS__QUEUE_DEPTH_CEILING`); errors name both so an
//! operator can fix whichever source set the value.

use thiserror::Error;

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// Environment variable that overrides the dotted configuration `key`.
#[must_use]
pub fn env_var(key: &str) -> String {
    let mut var = String::from(ENV_PREFIX);
    for segment in key.split('.') {
        var.push_str("__");
        var.push_str(&segment.to_uppercase());
    }
    var
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A setting holds a value the orchestrator cannot run with.
    #[error("{key}: {problem}\n   fix: {hint} (or set {})", env_var(.key))]
    InvalidValue {
        key: String,
        problem: String,
        hint: String,
    },

    /// Two settings contradict each other.
    #[error("{key} conflicts with {other}: {reason}")]
    Conflict {
        key: String,
        other: String,
        reason: String,
    },

    /// `agents.<tag>` does not name a known agent.
    #[error("agents.{tag}: unknown agent tag\n   fix: remove it or use a snake_case agent tag such as cover_letter")]
    UnknownAgent { tag: String },

    #[error("{} configuration problems:{}", .0.len(), numbered(.0))]
    Multiple(Vec<ConfigurationError>),
}

fn numbered(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("\n\n{}. {e}", i + 1))
        .collect()
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(key: impl Into<String>, problem: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            problem: problem.into(),
            hint: hint.into(),
        }
    }

    #[must_use]
    pub fn conflict(key: impl Into<String>, other: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            other: other.into(),
            reason: reason.into(),
        }
    }

    /// Collapse collected problems: `None` when empty, the error itself when
    /// there is one.
    #[must_use]
    pub fn collect(mut errors: Vec<ConfigurationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Every configuration key involved, in report order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::InvalidValue { key, .. } => vec![key.clone()],
            Self::Conflict { key, other, .. } => vec![key.clone(), other.clone()],
            Self::UnknownAgent { tag } => vec![format!("agents.{tag}")],
            Self::Multiple(errors) => errors.iter().flat_map(Self::keys).collect(),
        }
    }

    /// Number of problems reported.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;
