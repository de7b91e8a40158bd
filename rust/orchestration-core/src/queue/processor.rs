//! Worker pool draining the task queue into the workflow engine.
//!
//! Each of the `max_concurrent_workers` workers pops the highest-priority
//! task, runs its execution to a terminal status and only then pops the
//! next one. A task that fails before an execution exists is re-queued with
//! backoff up to `task_max_retries` times, then dead-lettered; so is a
//! redelivery still pending at shutdown.
//!
//! Task states of finished tasks and dead letters are kept up to
//! `retained_tasks` and `dead_letter_capacity`, oldest dropped first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{QueuedTask, TaskQueue};
use crate::agent::Priority;
use crate::backoff::Backoff;
use crate::config::WorkerConfig;
use crate::error::{ErrorInfo, OrchestratorError, OrchestratorResult};
use crate::logging::PhaseTimer;
use crate::workflow::WorkflowEngine;

/// Lifecycle of a queued task as seen by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    /// Waiting out the backoff before redelivery.
    Retrying { attempt: u32 },
    Completed,
    DeadLettered,
}

impl TaskState {
    /// No further transitions happen from this state.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }
}

/// A task that exhausted its redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub task: QueuedTask,
    pub error: ErrorInfo,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    fn new(task: QueuedTask, error: &OrchestratorError) -> Self {
        Self {
            task,
            error: error.to_info(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Ledger {
    states: RwLock<HashMap<String, TaskState>>,
    /// Ids of tasks in a final state, oldest first.
    finished: Mutex<VecDeque<String>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    retained_tasks: usize,
    dead_letter_capacity: usize,
}

impl Ledger {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            retained_tasks: config.retained_tasks.max(1),
            dead_letter_capacity: config.dead_letter_capacity.max(1),
        }
    }

    fn set(&self, task_id: &str, state: TaskState) {
        self.states.write().insert(task_id.to_string(), state);
    }

    fn forget(&self, task_id: &str) {
        self.states.write().remove(task_id);
    }

    /// Record a final state and drop the oldest finished tasks past the
    /// retention limit.
    fn finish(&self, task_id: &str, state: TaskState) {
        let mut finished = self.finished.lock();
        let mut states = self.states.write();
        states.insert(task_id.to_string(), state);
        finished.push_back(task_id.to_string());

        while finished.len() > self.retained_tasks {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            if states.get(&oldest).is_some_and(TaskState::is_final) {
                states.remove(&oldest);
            }
        }
    }

    fn dead_letter(&self, letter: DeadLetter) {
        self.finish(&letter.task.id, TaskState::DeadLettered);
        let mut letters = self.dead_letters.lock();
        letters.push_back(letter);
        while letters.len() > self.dead_letter_capacity {
            letters.pop_front();
        }
    }
}

pub struct TaskQueueProcessor {
    engine: Arc<WorkflowEngine>,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    ledger: Arc<Ledger>,
    workers: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl TaskQueueProcessor {
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>, queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        let ledger = Arc::new(Ledger::new(&config));
        Self {
            engine,
            queue,
            config,
            ledger,
            workers: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a workflow trigger. Returns the task id, which is also the id
    /// of the execution created when the task runs.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::QueueFull`] at the depth ceiling and
    /// [`OrchestratorError::QueueClosed`] after shutdown; nothing is buffered.
    pub async fn enqueue(
        &self,
        workflow_type: &str,
        user_id: &str,
        priority: Priority,
        payload: serde_json::Value,
    ) -> OrchestratorResult<String> {
        self.submit(QueuedTask::new(workflow_type, user_id, priority, payload))
            .await
    }

    /// Push a prepared task and track it as QUEUED. Returns its id.
    pub async fn submit(&self, task: QueuedTask) -> OrchestratorResult<String> {
        let task_id = task.id.clone();
        let workflow_type = task.workflow_type.clone();
        let priority = task.priority;

        self.ledger.set(&task_id, TaskState::Queued);
        if let Err(e) = self.queue.push(task).await {
            self.ledger.forget(&task_id);
            tracing::warn!(task_id = %task_id, workflow_type = %workflow_type, error = %e, "Task rejected");
            return Err(e);
        }

        tracing::info!(task_id = %task_id, workflow_type = %workflow_type, priority = %priority, "Task enqueued");
        Ok(task_id)
    }

    /// Spawn the worker pool. Calling it again while workers run is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            tracing::warn!(workers = workers.len(), "Task queue processor already started");
            return;
        }

        for id in 0..self.config.max_concurrent_workers.max(1) {
            let worker = Worker {
                id,
                engine: Arc::clone(&self.engine),
                queue: Arc::clone(&self.queue),
                ledger: Arc::clone(&self.ledger),
                max_retries: self.config.task_max_retries,
                backoff: self.config.task_backoff(),
                shutdown: self.shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        tracing::info!(
            workers = self.config.max_concurrent_workers.max(1),
            queue_depth_ceiling = self.config.queue_depth_ceiling,
            "Task queue processor started"
        );
    }

    /// Stop accepting tasks, let running executions finish and join the
    /// workers.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down task queue processor");
        let timer = PhaseTimer::start("drain_workers");
        self.shutdown.cancel();
        self.queue.close().await;

        let mut workers = std::mem::take(&mut *self.workers.lock());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker ended abnormally");
            }
        }
        timer.done();
    }

    #[must_use]
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.ledger.states.read().get(task_id).copied()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.ledger.dead_letters.lock().iter().cloned().collect()
    }

    /// Tasks waiting for a worker.
    pub async fn depth(&self) -> usize {
        self.queue.depth().await
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl std::fmt::Debug for TaskQueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueProcessor")
            .field("config", &self.config)
            .field("workers", &self.workers.lock().len())
            .field("dead_letters", &self.ledger.dead_letters.lock().len())
            .finish_non_exhaustive()
    }
}

struct Worker {
    id: usize,
    engine: Arc<WorkflowEngine>,
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<Ledger>,
    max_retries: u32,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");
        loop {
            let task = tokio::select! {
                () = self.shutdown.cancelled() => break,
                task = self.queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let span = tracing::info_span!(
                "task",
                worker = self.id,
                task_id = %task.id,
                workflow_type = %task.workflow_type,
                attempt = task.attempt,
            );
            self.handle(task).instrument(span).await;
        }
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn handle(&self, task: QueuedTask) {
        self.ledger.set(&task.id, TaskState::Running);

        match self.engine.run_task(&task).await {
            Ok(execution) => {
                tracing::info!(
                    execution_id = %execution.id,
                    status = %execution.status,
                    "Task finished"
                );
                self.ledger.finish(&task.id, TaskState::Completed);
                self.ack(&task.id).await;
            }
            Err(e) => self.retry_or_dead_letter(task, &e).await,
        }
    }

    async fn retry_or_dead_letter(&self, task: QueuedTask, error: &OrchestratorError) {
        if task.attempt < self.max_retries {
            let next = task.next_attempt();
            let delay = self.backoff.delay(next.attempt);
            tracing::warn!(
                error = %error,
                next_attempt = next.attempt,
                max_retries = self.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Task failed before producing an execution, retrying"
            );
            self.ledger.set(&task.id, TaskState::Retrying { attempt: next.attempt });
            self.schedule_requeue(next, delay);
            return;
        }

        tracing::error!(
            error = %error,
            attempts = task.attempt + 1,
            "Task exhausted its retries, dead-lettering"
        );
        let task_id = task.id.clone();
        self.ledger.dead_letter(DeadLetter::new(task, error));
        self.ack(&task_id).await;
    }

    fn schedule_requeue(&self, task: QueuedTask, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let ledger = Arc::clone(&self.ledger);
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                let requeued = tokio::select! {
                    () = shutdown.cancelled() => Err(OrchestratorError::QueueClosed),
                    () = tokio::time::sleep(delay) => queue.requeue(task.clone()).await,
                };
                if let Err(e) = requeued {
                    tracing::warn!(error = %e, "Redelivery abandoned, dead-lettering task");
                    ledger.dead_letter(DeadLetter::new(task, &e));
                }
            }
            .in_current_span(),
        );
    }

    async fn ack(&self, task_id: &str) {
        if let Err(e) = self.queue.ack(task_id).await {
            tracing::warn!(task_id, error = %e, "Failed to acknowledge task");
        }
    }
}
