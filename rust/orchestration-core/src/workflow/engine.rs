//! Workflow engine: drives executions through their step graphs.
//!
//! `start` only records the execution and enqueues a task; the work
//! happens when a queue worker hands the task to [`WorkflowEngine::run_task`].
//!
//! Inside a run, every step whose dependencies are settled is started
//! concurrently (bounded by an engine-wide permit pool) and the graph is
//! re-evaluated each time a step finishes. A dependency is settled for a
//! step when it COMPLETED, or when it did not complete but the step is
//! optional or the policy is `continue`. Steps whose dependencies can no
//! longer settle are SKIPPED with [`DEPENDENCY_FAILED`].
//!
//! Failure handling by policy:
//!
//! - `abort`: retryable failures (transport, timeout) are retried in place
//!   with backoff; a required step that still fails halts the run. Agent
//!   calls already underway finish, steps still waiting for a permit or a
//!   retry are SKIPPED with [`WORKFLOW_HALTED`] and nothing else starts.
//! - `continue`: same in-place retries; failures never stop scheduling.
//! - `retry`: any failure re-enqueues the step after a backoff delay until
//!   its attempt budget is spent; a required step failing after that
//!   behaves like `abort`.
//!
//! Circuit-open failures are never retried in place.
//!
//! Settled executions stay queryable for `execution_ttl_ms`, and at most
//! `retained_executions` of them are kept.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::catalog::WorkflowCatalog;
use super::definition::{ErrorPolicy, WorkflowDefinition, WorkflowStep};
use super::execution::{ExecutionStatus, Interruption, StepStatus, WorkflowContext, WorkflowExecution};
use crate::agent::{AgentClient, AgentRequest, AgentResponse, Priority};
use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::error::{ErrorInfo, OrchestratorError, OrchestratorResult};
use crate::queue::{QueuedTask, TaskQueue};

/// Step error code: the agent answered with `success: false`.
pub const AGENT_ERROR: &str = "AGENT_ERROR";

/// Step error code: skipped because a dependency did not complete.
pub const DEPENDENCY_FAILED: &str = "DEPENDENCY_FAILED";

/// Step error code: never started because a required step failed and the
/// run stopped scheduling.
pub const WORKFLOW_HALTED: &str = "WORKFLOW_HALTED";

fn halted_error() -> ErrorInfo {
    ErrorInfo::new(WORKFLOW_HALTED, "Workflow stopped after a required step failed")
}

/// Initial variables of an execution.
pub type Variables = serde_json::Map<String, serde_json::Value>;

struct ExecutionSlot {
    execution: WorkflowExecution,
    definition: Arc<WorkflowDefinition>,
    cancel: CancellationToken,
}

/// Executes workflow templates from a [`WorkflowCatalog`].
pub struct WorkflowEngine {
    catalog: Arc<WorkflowCatalog>,
    client: AgentClient,
    queue: Arc<dyn TaskQueue>,
    executions: RwLock<HashMap<String, ExecutionSlot>>,
    /// Signalled whenever an execution reaches a terminal status.
    settled: Notify,
    step_permits: Arc<Semaphore>,
    step_backoff: Backoff,
    retained_executions: usize,
    execution_ttl_ms: u64,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(
        catalog: Arc<WorkflowCatalog>,
        client: AgentClient,
        queue: Arc<dyn TaskQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            catalog,
            client,
            queue,
            executions: RwLock::new(HashMap::new()),
            settled: Notify::new(),
            step_permits: Arc::new(Semaphore::new(config.engine_concurrency.max(1))),
            step_backoff: config.step_backoff(),
            retained_executions: config.retained_executions.max(1),
            execution_ttl_ms: config.execution_ttl_ms,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    /// Create an execution and enqueue it at medium priority.
    pub async fn start(
        &self,
        workflow_type: &str,
        user_id: &str,
        variables: Variables,
    ) -> OrchestratorResult<String> {
        self.start_with_priority(workflow_type, user_id, variables, Priority::default())
            .await
    }

    /// Create an execution in QUEUED status and enqueue it. Returns the
    /// execution id without waiting for the run.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownWorkflow`] for an unregistered type, or
    /// the queue's rejection (e.g. [`OrchestratorError::QueueFull`]); no
    /// execution is kept in either case.
    pub async fn start_with_priority(
        &self,
        workflow_type: &str,
        user_id: &str,
        variables: Variables,
        priority: Priority,
    ) -> OrchestratorResult<String> {
        let task = self.prepare(workflow_type, user_id, variables, priority)?;
        let execution_id = task.id.clone();

        if let Err(e) = self.queue.push(task).await {
            self.discard(&execution_id);
            tracing::warn!(
                execution_id = %execution_id,
                workflow_type,
                error = %e,
                "Workflow trigger rejected"
            );
            return Err(e);
        }

        tracing::info!(
            execution_id = %execution_id,
            workflow_type,
            user_id,
            priority = %priority,
            "Workflow queued"
        );
        Ok(execution_id)
    }

    /// Record a QUEUED execution and build the task that drives it. The task
    /// carries the execution id as its own.
    pub(crate) fn prepare(
        &self,
        workflow_type: &str,
        user_id: &str,
        variables: Variables,
        priority: Priority,
    ) -> OrchestratorResult<QueuedTask> {
        let definition = self
            .catalog
            .get(workflow_type)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow_type.to_string()))?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut execution = WorkflowExecution::new(&definition, &execution_id, user_id);
        execution.status = ExecutionStatus::Queued;
        execution
            .metadata
            .insert("priority".to_string(), serde_json::json!(priority));
        self.insert(execution, definition);

        Ok(QueuedTask::new(
            workflow_type,
            user_id,
            priority,
            serde_json::Value::Object(variables),
        )
        .for_execution(execution_id))
    }

    /// Forget an execution whose task never reached the queue.
    pub(crate) fn discard(&self, execution_id: &str) {
        self.executions.write().remove(execution_id);
    }

    fn insert(&self, execution: WorkflowExecution, definition: Arc<WorkflowDefinition>) {
        self.executions.write().insert(
            execution.id.clone(),
            ExecutionSlot {
                execution,
                definition,
                cancel: CancellationToken::new(),
            },
        );
    }

    /// Run the execution behind a dequeued task to a terminal status.
    ///
    /// Tasks without an execution get one whose id is the task id.
    ///
    /// # Errors
    ///
    /// Only when no execution could be produced or found; step failures
    /// are recorded on the returned execution instead.
    pub async fn run_task(&self, task: &QueuedTask) -> OrchestratorResult<WorkflowExecution> {
        let execution_id = match &task.execution_id {
            Some(id) => id.clone(),
            None => self.admit(task)?,
        };

        let variables = match &task.payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => Variables::new(),
            other => {
                let mut map = Variables::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };

        self.run(&execution_id, variables).await
    }

    fn admit(&self, task: &QueuedTask) -> OrchestratorResult<String> {
        let definition = self
            .catalog
            .get(&task.workflow_type)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(task.workflow_type.clone()))?;

        self.executions
            .write()
            .entry(task.id.clone())
            .or_insert_with(|| {
                let mut execution = WorkflowExecution::new(&definition, &task.id, &task.user_id);
                execution
                    .metadata
                    .insert("taskId".to_string(), serde_json::json!(task.id));
                ExecutionSlot {
                    execution,
                    definition: Arc::clone(&definition),
                    cancel: CancellationToken::new(),
                }
            });

        Ok(task.id.clone())
    }

    async fn run(&self, execution_id: &str, variables: Variables) -> OrchestratorResult<WorkflowExecution> {
        let (execution, definition, cancel) = {
            let mut executions = self.executions.write();
            let slot = executions
                .get_mut(execution_id)
                .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;

            match slot.execution.status {
                ExecutionStatus::Pending | ExecutionStatus::Queued => {}
                status => {
                    tracing::debug!(execution_id, status = %status, "Execution already picked up");
                    return Ok(slot.execution.clone());
                }
            }

            slot.execution.status = ExecutionStatus::Processing;
            slot.execution.started_at = Some(Utc::now());
            (
                slot.execution.clone(),
                Arc::clone(&slot.definition),
                slot.cancel.clone(),
            )
        };

        let span = tracing::info_span!(
            "workflow",
            execution_id = %execution.id,
            workflow_type = %execution.workflow_type,
            correlation_id = %execution.correlation_id,
        );

        let run = Run::new(self, definition, execution, variables, cancel);
        Ok(run.drive().instrument(span).await)
    }

    /// Snapshot of an execution.
    pub fn get_status(&self, execution_id: &str) -> OrchestratorResult<WorkflowExecution> {
        self.executions
            .read()
            .get(execution_id)
            .map(|slot| slot.execution.clone())
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Snapshots of every known execution.
    #[must_use]
    pub fn executions(&self) -> Vec<WorkflowExecution> {
        self.executions
            .read()
            .values()
            .map(|slot| slot.execution.clone())
            .collect()
    }

    /// Request cancellation.
    ///
    /// A queued execution becomes CANCELLED immediately. A running one stops
    /// scheduling new steps and becomes CANCELLED once its in-flight steps
    /// finish. Terminal executions are returned unchanged.
    pub fn cancel(&self, execution_id: &str) -> OrchestratorResult<WorkflowExecution> {
        let snapshot = {
            let mut executions = self.executions.write();
            let slot = executions
                .get_mut(execution_id)
                .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;

            if slot.execution.is_terminal() {
                return Ok(slot.execution.clone());
            }

            slot.cancel.cancel();
            if matches!(
                slot.execution.status,
                ExecutionStatus::Pending | ExecutionStatus::Queued
            ) {
                let error = OrchestratorError::Cancelled(execution_id.to_string()).to_info();
                slot.execution
                    .finish(&slot.definition, Some(Interruption::Cancelled), Some(error), None);
            }
            slot.execution.clone()
        };

        tracing::info!(execution_id, status = %snapshot.status, "Workflow cancellation requested");
        if snapshot.is_terminal() {
            self.evict_settled();
            self.settled.notify_waiters();
        }
        Ok(snapshot)
    }

    /// Wait until the execution is terminal or `timeout` elapses, then
    /// return its latest snapshot.
    pub async fn wait_until_settled(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> OrchestratorResult<WorkflowExecution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.get_status(execution_id)?;
            if snapshot.is_terminal() {
                return Ok(snapshot);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get_status(execution_id);
            }
        }
    }

    fn publish(&self, execution: &WorkflowExecution) {
        if let Some(slot) = self.executions.write().get_mut(&execution.id) {
            slot.execution = execution.clone();
        }
    }

    /// Drop settled executions past their TTL, then the oldest settled ones
    /// beyond the retention cap.
    fn evict_settled(&self) {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let before = executions.len();

        executions.retain(|_, slot| {
            let execution = &slot.execution;
            match execution.completed_at {
                Some(completed) if execution.is_terminal() => {
                    let age_ms = u64::try_from((now - completed).num_milliseconds()).unwrap_or(0);
                    age_ms < self.execution_ttl_ms
                }
                _ => true,
            }
        });

        let mut settled: Vec<_> = executions
            .values()
            .filter(|slot| slot.execution.is_terminal())
            .map(|slot| (slot.execution.completed_at, slot.execution.id.clone()))
            .collect();
        if settled.len() > self.retained_executions {
            settled.sort();
            let excess = settled.len() - self.retained_executions;
            for (_, id) in settled.drain(..excess) {
                executions.remove(&id);
            }
        }

        let evicted = before - executions.len();
        if evicted > 0 {
            tracing::debug!(evicted, retained = executions.len(), "Evicted settled executions");
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.catalog.len())
            .field("executions", &self.executions.read().len())
            .field("available_step_permits", &self.step_permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// What a step task reports back to its run.
#[derive(Debug)]
struct StepOutcome {
    step_id: String,
    /// In-place retries performed.
    retries: u32,
    result: OrchestratorResult<AgentResponse>,
    /// Stopped by the run's halt token before a final answer.
    interrupted: bool,
    /// At least one call of this attempt reached the agent client.
    invoked: bool,
}

/// One scheduled step call, including its in-place retries.
struct StepAttempt {
    step_id: String,
    client: AgentClient,
    permits: Arc<Semaphore>,
    backoff: Backoff,
    request: AgentRequest,
    in_place_retries: u32,
    delay: Option<Duration>,
    /// Cancelled when the run stops scheduling.
    halt: CancellationToken,
    /// A final failure of this attempt halts the run.
    halts_run: bool,
}

impl StepAttempt {
    async fn run(self) -> StepOutcome {
        let halt = self.halt.clone();
        let permits = Arc::clone(&self.permits);

        if let Some(delay) = self.delay {
            tokio::select! {
                biased;
                () = halt.cancelled() => return self.interrupted(0, None),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let mut retries = 0;
        let mut last_error = None;
        loop {
            let permit = tokio::select! {
                biased;
                () = halt.cancelled() => return self.interrupted(retries, last_error),
                permit = permits.acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    let error = OrchestratorError::Other(anyhow::anyhow!("step permits unavailable: {e}"));
                    let invoked = last_error.is_some();
                    return self.outcome(retries, Err(error), invoked);
                }
            };

            let result = self.client.invoke(self.request.clone()).await;
            match result {
                Err(e) if e.is_retryable() && retries < self.in_place_retries => {
                    drop(permit);
                    retries += 1;
                    let delay = self.backoff.delay(retries);
                    tracing::warn!(
                        attempt = retries,
                        max_retries = self.in_place_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Step call failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::select! {
                        biased;
                        () = halt.cancelled() => return self.interrupted(retries, last_error),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                result => {
                    let failed = !matches!(&result, Ok(response) if response.success);
                    if failed && self.halts_run {
                        // Steps queued on the permit must see the halt once it is released.
                        self.halt.cancel();
                    }
                    drop(permit);
                    return self.outcome(retries, result, true);
                }
            }
        }
    }

    fn interrupted(self, retries: u32, last_error: Option<OrchestratorError>) -> StepOutcome {
        let invoked = last_error.is_some();
        let error = last_error.unwrap_or_else(|| OrchestratorError::Cancelled(self.step_id.clone()));
        StepOutcome {
            step_id: self.step_id,
            retries,
            result: Err(error),
            interrupted: true,
            invoked,
        }
    }

    fn outcome(self, retries: u32, result: OrchestratorResult<AgentResponse>, invoked: bool) -> StepOutcome {
        StepOutcome {
            step_id: self.step_id,
            retries,
            result,
            interrupted: false,
            invoked,
        }
    }
}

/// State of one execution while it runs. Owns the execution record and
/// publishes snapshots to the engine's store.
struct Run<'e> {
    engine: &'e WorkflowEngine,
    definition: Arc<WorkflowDefinition>,
    execution: WorkflowExecution,
    ctx: WorkflowContext,
    in_flight: JoinSet<StepOutcome>,
    cancel: CancellationToken,
    /// Child of `cancel`; also cancelled by a halting failure or the
    /// deadline. No new steps are scheduled once it is cancelled.
    halt: CancellationToken,
    interruption: Option<Interruption>,
}

impl<'e> Run<'e> {
    fn new(
        engine: &'e WorkflowEngine,
        definition: Arc<WorkflowDefinition>,
        execution: WorkflowExecution,
        variables: Variables,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = WorkflowContext::new(&execution.user_id, &execution.correlation_id, variables);
        let halt = cancel.child_token();
        Self {
            engine,
            definition,
            execution,
            ctx,
            in_flight: JoinSet::new(),
            cancel,
            halt,
            interruption: None,
        }
    }

    fn halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    async fn drive(mut self) -> WorkflowExecution {
        tracing::info!(
            steps = self.definition.steps.len(),
            on_error = %self.definition.on_error,
            max_duration_ms = self.definition.max_duration_ms,
            "Workflow started"
        );

        let deadline = tokio::time::sleep(Duration::from_millis(self.definition.max_duration_ms));
        tokio::pin!(deadline);

        loop {
            if self.interruption.is_none() && self.cancel.is_cancelled() {
                self.halt_for_cancel();
            }
            if !self.halted() {
                self.schedule_ready();
            }
            self.engine.publish(&self.execution);

            if self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled(), if self.interruption.is_none() => {
                    self.halt_for_cancel();
                }
                () = &mut deadline => {
                    tracing::warn!(
                        max_duration_ms = self.definition.max_duration_ms,
                        in_flight = self.in_flight.len(),
                        "Workflow exceeded max duration"
                    );
                    self.in_flight.abort_all();
                    self.halt.cancel();
                    self.interruption.get_or_insert(Interruption::TimedOut);
                    break;
                }
                Some(joined) = self.in_flight.join_next() => match joined {
                    Ok(outcome) => self.settle(outcome),
                    Err(e) => tracing::error!(error = %e, "Step task ended without an outcome"),
                },
            }
        }

        self.finish()
    }

    fn halt_for_cancel(&mut self) {
        tracing::info!(in_flight = self.in_flight.len(), "Cancellation requested, draining in-flight steps");
        self.interruption = Some(Interruption::Cancelled);
    }

    fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.execution.step(step_id).map(|s| s.status)
    }

    /// Start every pending step whose dependencies are settled, skipping
    /// steps that can no longer run, until nothing changes.
    fn schedule_ready(&mut self) {
        let definition = Arc::clone(&self.definition);
        let tolerant_policy = definition.on_error == ErrorPolicy::Continue;

        loop {
            let mut skipped_any = false;

            for step in &definition.steps {
                if self.status_of(&step.id) != Some(StepStatus::Pending) {
                    continue;
                }

                let tolerant = tolerant_policy || step.optional;
                let mut ready = true;
                let mut blocked_by = None;
                for dep in &step.depends_on {
                    match self.status_of(dep) {
                        Some(StepStatus::Completed) => {}
                        Some(StepStatus::Pending | StepStatus::Running) | None => ready = false,
                        Some(_) if tolerant => {}
                        Some(_) => {
                            blocked_by = Some(dep.as_str());
                            break;
                        }
                    }
                }

                if let Some(dep) = blocked_by {
                    self.skip(step, dep);
                    skipped_any = true;
                } else if ready {
                    self.spawn_step(step, None);
                }
            }

            if !skipped_any {
                break;
            }
        }
    }

    fn skip(&mut self, step: &WorkflowStep, dependency: &str) {
        tracing::info!(step_id = %step.id, dependency, "Step skipped, dependency did not complete");
        if let Some(record) = self.execution.step_mut(&step.id) {
            record.status = StepStatus::Skipped;
            record.completed_at = Some(Utc::now());
            record.error = Some(ErrorInfo::new(
                DEPENDENCY_FAILED,
                format!("Dependency '{dependency}' did not complete"),
            ));
        }
    }

    fn retry_budget(&self, step: &WorkflowStep) -> u32 {
        step.retry_attempts
            .unwrap_or_else(|| self.engine.client.agents().get(step.agent).retry_attempts)
    }

    fn spawn_step(&mut self, step: &WorkflowStep, delay: Option<Duration>) {
        let policy = self.definition.on_error;
        let budget = self.retry_budget(step);
        let retry_count = self.execution.step(&step.id).map_or(0, |record| record.retry_count);
        let in_place_retries = match policy {
            ErrorPolicy::Retry => 0,
            ErrorPolicy::Abort | ErrorPolicy::Continue => budget,
        };
        let halts_run = !step.optional
            && match policy {
                ErrorPolicy::Abort => true,
                ErrorPolicy::Continue => false,
                ErrorPolicy::Retry => retry_count >= budget,
            };

        let mut request = AgentRequest::new(
            step.agent,
            &step.action,
            self.ctx.step_payload(&step.params, &step.depends_on),
            &self.ctx.user_id,
            &self.ctx.correlation_id,
        );
        if let Some(priority) = self
            .execution
            .metadata
            .get("priority")
            .and_then(|p| serde_json::from_value::<Priority>(p.clone()).ok())
        {
            request = request.with_priority(priority);
        }
        if let Some(timeout_ms) = step.timeout_ms {
            request = request.with_timeout(timeout_ms);
        }

        let attempt = StepAttempt {
            step_id: step.id.clone(),
            client: self.engine.client.clone(),
            permits: Arc::clone(&self.engine.step_permits),
            backoff: self.engine.step_backoff,
            request,
            in_place_retries,
            delay,
            halt: self.halt.clone(),
            halts_run,
        };

        let step_id = step.id.clone();
        let span = tracing::info_span!("step", step_id = %step.id, agent = %step.agent);
        self.in_flight.spawn(
            async move {
                match AssertUnwindSafe(attempt.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => StepOutcome {
                        step_id,
                        retries: 0,
                        result: Err(OrchestratorError::Other(anyhow::anyhow!("step task panicked"))),
                        interrupted: false,
                        invoked: false,
                    },
                }
            }
            .instrument(span),
        );

        if let Some(record) = self.execution.step_mut(&step.id) {
            if record.status == StepStatus::Pending {
                tracing::debug!(step_id = %step.id, agent = %step.agent, "Step started");
                record.started_at = Some(Utc::now());
            }
            record.status = StepStatus::Running;
        }
    }

    fn settle(&mut self, outcome: StepOutcome) {
        let definition = Arc::clone(&self.definition);
        let StepOutcome {
            step_id,
            retries,
            result,
            interrupted,
            invoked,
        } = outcome;
        let Some(step) = definition.get_step(&step_id) else {
            return;
        };

        match result {
            Ok(response) if response.success => {
                tracing::info!(
                    step_id = %step_id,
                    execution_time_ms = response.execution_time_ms,
                    "Step completed"
                );
                if let Some(record) = self.execution.step_mut(&step_id) {
                    record.status = StepStatus::Completed;
                    record.completed_at = Some(Utc::now());
                    record.result.clone_from(&response.data);
                    record.error = None;
                    record.retry_count += retries;
                }
                self.ctx.record(&step_id, response);
            }
            Err(e) if interrupted => self.interrupt_step(&step_id, retries, invoked, &e),
            Ok(response) => {
                let message = response
                    .error
                    .clone()
                    .unwrap_or_else(|| "Agent reported failure".to_string());
                self.ctx.record(&step_id, response);
                self.fail_step(step, retries, ErrorInfo::new(AGENT_ERROR, message));
            }
            Err(e) => self.fail_step(step, retries, e.to_info()),
        }
    }

    /// Close a step stopped by the halt token. Under cancellation it is
    /// CANCELLED; after a halting failure it is FAILED if it already reached
    /// its agent, otherwise SKIPPED.
    fn interrupt_step(&mut self, step_id: &str, retries: u32, invoked: bool, error: &OrchestratorError) {
        let cancelled = self.cancel.is_cancelled();
        let Some(record) = self.execution.step_mut(step_id) else {
            return;
        };
        record.retry_count += retries;
        record.completed_at = Some(Utc::now());

        if cancelled {
            tracing::info!(step_id, "Step interrupted by cancellation");
            record.status = StepStatus::Cancelled;
            record.error = Some(error.to_info());
        } else if invoked || record.retry_count > 0 {
            tracing::info!(step_id, retry_count = record.retry_count, "Step failed, no retry after halt");
            record.status = StepStatus::Failed;
            if invoked {
                record.error = Some(error.to_info());
            }
        } else {
            tracing::info!(step_id, "Step skipped, workflow halted before it reached its agent");
            record.status = StepStatus::Skipped;
            record.started_at = None;
            record.error = Some(halted_error());
        }
    }

    fn fail_step(&mut self, step: &WorkflowStep, retries: u32, error: ErrorInfo) {
        let policy = self.definition.on_error;
        let budget = self.retry_budget(step);

        let Some(record) = self.execution.step_mut(&step.id) else {
            return;
        };
        record.retry_count += retries;
        record.error = Some(error.clone());

        if policy == ErrorPolicy::Retry && !self.halt.is_cancelled() && record.retry_count < budget {
            record.retry_count += 1;
            let attempt = record.retry_count;
            let delay = self.engine.step_backoff.delay(attempt);
            tracing::warn!(
                step_id = %step.id,
                attempt,
                budget,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Step failed, re-enqueueing"
            );
            self.spawn_step(step, Some(delay));
            return;
        }

        record.status = StepStatus::Failed;
        record.completed_at = Some(Utc::now());
        tracing::warn!(
            step_id = %step.id,
            optional = step.optional,
            retry_count = record.retry_count,
            error = %error,
            "Step failed"
        );

        if !step.optional && policy != ErrorPolicy::Continue {
            tracing::warn!(
                step_id = %step.id,
                on_error = %policy,
                in_flight = self.in_flight.len(),
                "Required step failed, halting workflow"
            );
            self.halt.cancel();
        }
    }

    fn finish(mut self) -> WorkflowExecution {
        if self.interruption.is_none() && self.cancel.is_cancelled() {
            self.interruption = Some(Interruption::Cancelled);
        }

        let error = match self.interruption {
            Some(Interruption::TimedOut) => Some(
                OrchestratorError::WorkflowTimeout {
                    execution_id: self.execution.id.clone(),
                    max_duration_ms: self.definition.max_duration_ms,
                }
                .to_info(),
            ),
            Some(Interruption::Cancelled) => {
                Some(OrchestratorError::Cancelled(self.execution.id.clone()).to_info())
            }
            None => None,
        };
        let halt = (self.interruption.is_none() && self.halted()).then(halted_error);

        let result: serde_json::Map<_, _> = self
            .execution
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| (s.step_id.clone(), s.result.clone().unwrap_or_default()))
            .collect();
        self.execution.result = Some(serde_json::Value::Object(result));

        let status = self
            .execution
            .finish(&self.definition, self.interruption, error, halt.as_ref());

        if status == ExecutionStatus::Failed && self.execution.error.is_none() {
            self.execution.error = first_step_error(&self.execution);
        }

        if let (Some(started), Some(completed)) = (self.execution.started_at, self.execution.completed_at) {
            self.execution.metadata.insert(
                "durationMs".to_string(),
                serde_json::json!((completed - started).num_milliseconds()),
            );
        }

        let completed = self
            .execution
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        match &self.execution.error {
            None if status == ExecutionStatus::Completed => {
                tracing::info!(status = %status, completed, "Workflow finished");
            }
            error => tracing::warn!(
                status = %status,
                completed,
                total = self.execution.steps.len(),
                error = ?error,
                "Workflow finished"
            ),
        }

        self.engine.publish(&self.execution);
        self.engine.evict_settled();
        self.engine.settled.notify_waiters();
        self.execution
    }
}

/// Error of the first failed required step, else of the first failed step.
fn first_step_error(execution: &WorkflowExecution) -> Option<ErrorInfo> {
    let failed = |required_only: bool| {
        execution.steps.iter().find(|s| {
            s.status == StepStatus::Failed && s.error.is_some() && (!required_only || !s.optional)
        })
    };
    failed(true).or_else(|| failed(false)).and_then(|s| {
        s.error
            .as_ref()
            .map(|e| ErrorInfo::new(e.code.clone(), format!("Step '{}' failed: {}", s.step_id, e.message)))
    })
}
