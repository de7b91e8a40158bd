//! Logging setup and operation timing.

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns an error if a
/// global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

/// Times one startup or shutdown phase of the orchestrator.
///
/// ```rust,ignore
/// let catalog = PhaseTimer::start("build_catalog").record(build_catalog(&config.workflows))?;
/// ```
#[derive(Debug)]
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    #[must_use]
    pub fn start(phase: &'static str) -> Self {
        tracing::debug!(phase, "Phase started");
        Self {
            phase,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Log a phase that cannot fail.
    pub fn done(self) {
        tracing::info!(phase = self.phase, duration_ms = self.elapsed_ms(), "Phase completed");
    }

    /// Log the outcome of a fallible phase and hand the result back.
    pub fn record<T, E: std::fmt::Display>(self, result: Result<T, E>) -> Result<T, E> {
        let duration_ms = self.elapsed_ms();
        match &result {
            Ok(_) => tracing::info!(phase = self.phase, duration_ms, "Phase completed"),
            Err(e) => tracing::error!(phase = self.phase, duration_ms, error = %e, "Phase failed"),
        }
        result
    }
}
