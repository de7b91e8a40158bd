//! Orchestrator - Main Entry Point
//!
//! Runs the task queue workers against remote agents until interrupted.

use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;

use orchestration_core::config::{AppConfig, ConfigValidator};
use orchestration_core::logging::{self, PhaseTimer};
use orchestration_core::orchestrator::{build_catalog, Orchestrator};
use orchestration_core::HttpAgentTransport;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "Workflow orchestrator for remote career agents")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<String>,

    /// Log level, overrides the configured one.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty or json), overrides the configured one.
    #[arg(long)]
    log_format: Option<String>,

    /// Worker slots, overrides the configured count.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory of additional YAML workflow templates.
    #[arg(long)]
    workflows_dir: Option<std::path::PathBuf>,

    /// API key sent to agents as a bearer token.
    #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
    agent_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_unchecked(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(workers) = args.workers {
        config.workers.max_concurrent_workers = workers;
    }
    if let Some(dir) = args.workflows_dir {
        config.workflows.definitions_dir = Some(dir);
    }
    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

    logging::init(&config.logging)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting orchestrator");

    let catalog = PhaseTimer::start("build_catalog").record(build_catalog(&config.workflows))?;

    let transport = Arc::new(HttpAgentTransport::new(args.agent_api_key));
    let orchestrator = Orchestrator::new(&config, catalog, transport);
    orchestrator.start();

    shutdown_signal().await;

    orchestrator.shutdown().await;
    tracing::info!("Orchestrator shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
