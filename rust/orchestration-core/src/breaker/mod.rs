//! Circuit breaker for isolating failing agent dependencies.
//!
//! Each breaker tallies call outcomes in a fixed, time-based rolling window.
//! When the window holds at least `volume_threshold` calls and the error
//! percentage reaches `error_threshold_percentage`, the breaker opens and
//! short-circuits every call until `reset_timeout_ms` has elapsed.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Calls fail fast without invoking the action
//! - **HalfOpen**: Exactly one trial call is let through; success closes
//!   the circuit, failure re-opens it
//!
//! Failure counts do not decay on success; only the window ageing out
//! forgets them.
//!
//! # Example
//!
//! ```rust,ignore
//! use orchestration_core::breaker::{BreakerConfig, CircuitBreaker};
//!
//! let breaker = CircuitBreaker::new(AgentType::JobMatch, BreakerConfig::default());
//!
//! match breaker.execute(|| call_agent()).await {
//!     Ok(reply) => handle(reply),
//!     Err(BreakerError::Open) => defer(),
//!     Err(BreakerError::Inner(e)) => fail(e),
//! }
//! ```

pub mod registry;

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::agent::AgentType;

pub use registry::CircuitBreakerRegistry;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, all calls pass through.
    Closed,

    /// Too many failures, fail fast without attempting the call.
    Open,

    /// Testing recovery with a single trial call.
    HalfOpen,
}

impl CircuitState {
    /// Convert state to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Derived health of an agent dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No breaker exists for the agent yet.
    Unknown,
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Error percentage (0-100) in the window that opens the circuit.
    pub error_threshold_percentage: u32,
    /// Cooldown before a trial call is allowed.
    pub reset_timeout_ms: u64,
    /// Minimum calls in the window before the error percentage is judged.
    pub volume_threshold: u32,
    /// Width of the rolling window.
    pub rolling_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            reset_timeout_ms: 30_000,
            volume_threshold: 5,
            rolling_window_ms: 10_000,
        }
    }
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub state: CircuitState,
    pub status: HealthStatus,
    pub success_count: u64,
    pub error_count: u64,
    /// Calls short-circuited while open.
    pub rejected_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

/// Failure returned by [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The call was short-circuited; the action never ran.
    Open,
    /// The action ran and failed. Its error is passed through untouched.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("circuit open"),
            Self::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open => None,
            Self::Inner(e) => Some(e),
        }
    }
}

/// Inner state for circuit breaker.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,

    /// Call outcomes inside the rolling window (`true` = success).
    window: VecDeque<(Instant, bool)>,

    success_count: u64,
    error_count: u64,
    rejected_count: u64,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<DateTime<Utc>>,
    last_error_message: Option<String>,

    /// When circuit was opened (for cooldown calculation).
    opened_at: Option<Instant>,

    /// A half-open trial call is currently running.
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            success_count: 0,
            error_count: 0,
            rejected_count: 0,
            last_success: None,
            last_error: None,
            last_error_message: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, width: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > width {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_percentage(&self) -> u32 {
        if self.window.is_empty() {
            return 0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        u32::try_from(failures * 100 / self.window.len()).unwrap_or(100)
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker for one agent dependency.
///
/// # Thread Safety
///
/// Shared behind an [`std::sync::Arc`] by every concurrent caller of the
/// same agent; all state sits behind one lock.
pub struct CircuitBreaker {
    agent: AgentType,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    #[must_use]
    pub fn new(agent: AgentType, config: BreakerConfig) -> Self {
        Self {
            agent,
            config,
            inner: RwLock::new(BreakerInner::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    fn window_width(&self) -> Duration {
        Duration::from_millis(self.config.rolling_window_ms)
    }

    /// Run `action` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without invoking `action` while the
    /// circuit is open (or a half-open trial is already running). Any
    /// failure of `action` is recorded and handed back as
    /// [`BreakerError::Inner`].
    pub async fn execute<F, Fut, T, E>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let Some(admission) = self.admit() else {
            return Err(BreakerError::Open);
        };
        let mut permit = Permit {
            breaker: self,
            admission,
            settled: false,
        };

        match action().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure(&e.to_string());
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.reset_timeout());
                if cooled {
                    tracing::info!(
                        agent = %self.agent,
                        reset_timeout_ms = self.config.reset_timeout_ms,
                        "Circuit breaker transitioning to HalfOpen"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                } else {
                    inner.rejected_count += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected_count += 1;
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner.success_count += 1;
        inner.last_success = Some(Utc::now());

        match (admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                tracing::info!(agent = %self.agent, "Circuit breaker closing after successful trial call");
                inner.state = CircuitState::Closed;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                inner.window.clear();
            }
            (_, CircuitState::Closed) => {
                inner.window.push_back((now, true));
                inner.prune(now, self.window_width());
            }
            // Finished after the circuit had already opened; counters only.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission, message: &str) {
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner.error_count += 1;
        inner.last_error = Some(Utc::now());
        inner.last_error_message = Some(message.to_string());

        match (admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                tracing::warn!(agent = %self.agent, error = %message, "Circuit breaker reopening after failed trial call");
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                inner.opened_at = Some(now);
            }
            (_, CircuitState::Closed) => {
                inner.window.push_back((now, false));
                inner.prune(now, self.window_width());

                let volume = inner.window.len();
                let error_percentage = inner.error_percentage();
                tracing::debug!(
                    agent = %self.agent,
                    volume,
                    error_percentage,
                    "Circuit breaker recorded failure"
                );

                if volume >= self.config.volume_threshold as usize
                    && error_percentage >= self.config.error_threshold_percentage
                {
                    tracing::warn!(
                        agent = %self.agent,
                        volume,
                        error_percentage,
                        threshold = self.config.error_threshold_percentage,
                        reset_timeout_ms = self.config.reset_timeout_ms,
                        "Circuit breaker opening due to failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.window.clear();
                }
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Get current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Whether calls are currently being short-circuited.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Derived health of the dependency.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        let mut inner = self.inner.write();
        inner.prune(Instant::now(), self.window_width());
        self.status_of(&inner)
    }

    fn status_of(&self, inner: &BreakerInner) -> HealthStatus {
        match inner.state {
            CircuitState::Open => HealthStatus::Unhealthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                let degraded_at = self.config.error_threshold_percentage / 2;
                if !inner.window.is_empty() && degraded_at > 0 && inner.error_percentage() >= degraded_at {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.write();
        inner.prune(Instant::now(), self.window_width());
        CircuitStats {
            state: inner.state,
            status: self.status_of(&inner),
            success_count: inner.success_count,
            error_count: inner.error_count,
            rejected_count: inner.rejected_count,
            last_success: inner.last_success,
            last_error: inner.last_error,
            last_error_message: inner.last_error_message.clone(),
        }
    }

    /// Zero all counters and force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        tracing::info!(agent = %self.agent, "Circuit breaker manually reset");
        *inner = BreakerInner::new();
    }

    /// Get time until the circuit will admit a trial call.
    ///
    /// Returns `None` if the circuit is not Open.
    #[must_use]
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let inner = self.inner.read();

        if inner.state != CircuitState::Open {
            return None;
        }

        inner
            .opened_at
            .map(|opened_at| self.reset_timeout().saturating_sub(opened_at.elapsed()))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CircuitBreaker")
            .field("agent", &self.agent)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("success_count", &inner.success_count)
            .field("error_count", &inner.error_count)
            .finish_non_exhaustive()
    }
}

/// Admission ticket for one call. Dropping it unsettled (the caller's
/// future was cancelled) frees a half-open trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    fn success(&mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    fn failure(&mut self, message: &str) {
        self.settled = true;
        self.breaker.record_failure(self.admission, message);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
    }
}
