//! Registry owning one circuit breaker per agent.
//!
//! The registry is an ordinary object created once per process and shared
//! behind an `Arc`; breakers are created lazily on first use and live for
//! the lifetime of the registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use super::{BreakerConfig, BreakerError, CircuitBreaker, CircuitStats, HealthStatus};
use crate::agent::{AgentConfigTable, AgentType};

/// Keyed map of per-agent breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<AgentType, Arc<CircuitBreaker>>,
    agents: Arc<AgentConfigTable>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry. Breakers created on demand take their
    /// thresholds from `agents`.
    #[must_use]
    pub fn new(agents: Arc<AgentConfigTable>) -> Self {
        Self {
            breakers: DashMap::new(),
            agents,
        }
    }

    /// Return the breaker for `agent`, creating it from `config` (or the
    /// agent's configured thresholds) if none exists yet.
    ///
    /// Concurrent first calls for the same agent still produce exactly one
    /// breaker; `config` is ignored once a breaker exists.
    pub fn get_or_create(&self, agent: AgentType, config: Option<BreakerConfig>) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(agent).or_insert_with(|| {
            let config = config.unwrap_or_else(|| self.agents.get(agent).breaker.clone());
            tracing::debug!(
                agent = %agent,
                error_threshold_percentage = config.error_threshold_percentage,
                volume_threshold = config.volume_threshold,
                reset_timeout_ms = config.reset_timeout_ms,
                "Creating circuit breaker"
            );
            Arc::new(CircuitBreaker::new(agent, config))
        });
        Arc::clone(entry.value())
    }

    /// Run `action` through the agent's breaker, creating it on demand.
    pub async fn execute<F, Fut, T, E>(&self, agent: AgentType, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let breaker = self.get_or_create(agent, None);
        breaker.execute(action).await
    }

    fn get(&self, agent: AgentType) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&agent).map(|b| Arc::clone(b.value()))
    }

    /// Health of an agent; [`HealthStatus::Unknown`] if it was never called.
    #[must_use]
    pub fn status(&self, agent: AgentType) -> HealthStatus {
        self.get(agent).map_or(HealthStatus::Unknown, |b| b.status())
    }

    #[must_use]
    pub fn is_open(&self, agent: AgentType) -> bool {
        self.get(agent).is_some_and(|b| b.is_open())
    }

    #[must_use]
    pub fn stats(&self, agent: AgentType) -> Option<CircuitStats> {
        self.get(agent).map(|b| b.stats())
    }

    /// Stats for every agent that has a breaker.
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<AgentType, CircuitStats> {
        let breakers: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        breakers.into_iter().map(|(agent, b)| (agent, b.stats())).collect()
    }

    /// Zero the agent's counters and close its circuit. No-op for an agent
    /// without a breaker.
    pub fn reset_circuit(&self, agent: AgentType) {
        if let Some(breaker) = self.get(agent) {
            breaker.reset();
        }
    }

    pub fn reset_all_circuits(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}
