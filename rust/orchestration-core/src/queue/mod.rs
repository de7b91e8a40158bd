//! Task queue: trigger records waiting for a worker.
//!
//! [`TaskQueue`] is the seam to durable storage; it only has to provide
//! push/pop/ack semantics. [`InMemoryTaskQueue`] is the in-process
//! implementation: four priority tiers, FIFO within a tier, and a depth
//! ceiling past which pushes fail fast.

pub mod processor;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::agent::Priority;
use crate::error::{OrchestratorError, OrchestratorResult};

pub use processor::{DeadLetter, TaskQueueProcessor, TaskState};

/// Immutable trigger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: String,
    pub workflow_type: String,
    pub user_id: String,
    pub priority: Priority,
    /// Initial workflow variables.
    pub payload: serde_json::Value,
    /// Set when the execution record was created before enqueueing.
    pub execution_id: Option<String>,
    /// Failed deliveries so far.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    /// A new task with a fresh id and no execution yet.
    pub fn new(
        workflow_type: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_type: workflow_type.into(),
            user_id: user_id.into(),
            priority,
            payload,
            execution_id: None,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// A task that drives an already created execution. It takes the
    /// execution's id, so its task state is looked up under the same id.
    #[must_use]
    pub fn for_execution(mut self, execution_id: impl Into<String>) -> Self {
        let execution_id = execution_id.into();
        self.id.clone_from(&execution_id);
        self.execution_id = Some(execution_id);
        self
    }

    /// The same task, one delivery attempt later.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Storage for queued tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a new task.
    ///
    /// Fails with [`OrchestratorError::QueueFull`] at the depth ceiling and
    /// [`OrchestratorError::QueueClosed`] after [`TaskQueue::close`].
    async fn push(&self, task: QueuedTask) -> OrchestratorResult<()>;

    /// Return a delivered task to the queue for another attempt. Not subject
    /// to the ceiling.
    async fn requeue(&self, task: QueuedTask) -> OrchestratorResult<()>;

    /// Wait for the highest-priority task. `None` once the queue is closed.
    async fn pop(&self) -> Option<QueuedTask>;

    /// Acknowledge a delivered task as fully handled.
    async fn ack(&self, task_id: &str) -> OrchestratorResult<()>;

    /// Tasks waiting for delivery.
    async fn depth(&self) -> usize;

    /// Stop delivering; pending `pop` calls return `None`.
    async fn close(&self);
}

#[derive(Debug, Default)]
struct QueueState {
    /// Urgent, high, medium, low.
    tiers: [VecDeque<QueuedTask>; 4],
    /// Delivered but not yet acknowledged.
    unacked: HashMap<String, QueuedTask>,
    closed: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn pop_highest(&mut self) -> Option<QueuedTask> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }
}

const fn tier(priority: Priority) -> usize {
    match priority {
        Priority::Urgent => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    }
}

/// In-process priority queue with a depth ceiling.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    ceiling: usize,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryTaskQueue {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Delivered tasks not yet acknowledged.
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, task: QueuedTask) -> OrchestratorResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(OrchestratorError::QueueClosed);
            }
            let depth = state.depth();
            if depth >= self.ceiling {
                return Err(OrchestratorError::QueueFull {
                    depth,
                    ceiling: self.ceiling,
                });
            }
            state.tiers[tier(task.priority)].push_back(task);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn requeue(&self, task: QueuedTask) -> OrchestratorResult<()> {
        {
            let mut state = self.state.lock();
            state.unacked.remove(&task.id);
            state.tiers[tier(task.priority)].push_back(task);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Option<QueuedTask> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pop_highest() {
                    state.unacked.insert(task.id.clone(), task.clone());
                    return Some(task);
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, task_id: &str) -> OrchestratorResult<()> {
        self.state.lock().unacked.remove(task_id);
        Ok(())
    }

    async fn depth(&self) -> usize {
        self.state.lock().depth()
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn task(priority: Priority, n: u32) -> QueuedTask {
        QueuedTask::new("APPLICATION", format!("user-{n}"), priority, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_priority_tiers_then_fifo() {
        let queue = InMemoryTaskQueue::new(10);
        queue.push(task(Priority::Low, 1)).await.unwrap();
        queue.push(task(Priority::Medium, 2)).await.unwrap();
        queue.push(task(Priority::Urgent, 3)).await.unwrap();
        queue.push(task(Priority::Medium, 4)).await.unwrap();
        queue.push(task(Priority::High, 5)).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(queue.pop().await.unwrap().user_id);
        }
        assert_eq!(order, vec!["user-3", "user-5", "user-2", "user-4", "user-1"]);
        assert_eq!(queue.unacked(), 5);
    }

    #[tokio::test]
    async fn test_ceiling_rejects_immediately() {
        let queue = InMemoryTaskQueue::new(100);
        for n in 0..100 {
            queue.push(task(Priority::Medium, n)).await.unwrap();
        }

        let err = queue.push(task(Priority::Urgent, 100)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueFull { depth: 100, ceiling: 100 }));
        assert_eq!(queue.depth().await, 100);
    }

    #[tokio::test]
    async fn test_requeue_bypasses_ceiling() {
        let queue = InMemoryTaskQueue::new(1);
        queue.push(task(Priority::Medium, 1)).await.unwrap();
        let delivered = queue.pop().await.unwrap();
        queue.push(task(Priority::Medium, 2)).await.unwrap();

        queue.requeue(delivered.next_attempt()).await.unwrap();
        assert_eq!(queue.depth().await, 2);
        assert_eq!(queue.unacked(), 0);
    }

    #[tokio::test]
    async fn test_ack_clears_unacked() {
        let queue = InMemoryTaskQueue::new(5);
        queue.push(task(Priority::High, 1)).await.unwrap();
        let delivered = queue.pop().await.unwrap();
        assert_eq!(queue.unacked(), 1);
        queue.ack(&delivered.id).await.unwrap();
        assert_eq!(queue.unacked(), 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(InMemoryTaskQueue::new(5));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task(Priority::Low, 7)).await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped.user_id, "user-7");
    }

    #[tokio::test]
    async fn test_close_releases_waiters_and_rejects_pushes() {
        let queue = Arc::new(InMemoryTaskQueue::new(5));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(popped.is_none());
        assert!(matches!(
            queue.push(task(Priority::Low, 1)).await,
            Err(OrchestratorError::QueueClosed)
        ));
    }
}
