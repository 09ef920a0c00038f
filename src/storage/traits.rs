use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Checkpoint, CheckpointWrite, Event, Payload, PdcaTask, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("checkpoint conflict for task {task_id}: expected version {expected}, stored {current}")]
    CheckpointConflict {
        task_id: TaskId,
        expected: i64,
        current: i64,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable records for PDCA tasks, their leases, checkpoints and the event log.
///
/// Every conditional operation (`acquire_lease`, `release_lease`, `reschedule`,
/// `save_checkpoint`) must be atomic with respect to concurrent callers; it is the
/// only coordination the queue runners rely on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // Task records
    async fn upsert(&self, task: PdcaTask) -> StoreResult<PdcaTask>;
    async fn get_task(&self, task_id: &str) -> StoreResult<Option<PdcaTask>>;
    async fn list_tasks(&self) -> StoreResult<Vec<PdcaTask>>;
    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PdcaTask>>;

    // Leases
    async fn acquire_lease(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn release_lease(&self, task_id: &str, worker_id: &str) -> StoreResult<()>;
    /// Only applies while `worker_id` holds the lease and the task is still queued or
    /// running. `false` otherwise.
    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> StoreResult<bool>;

    // Checkpoints
    async fn get_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>>;
    async fn save_checkpoint(
        &self,
        task_id: &str,
        state: Payload,
        task_state: Payload,
        expected_version: i64,
    ) -> StoreResult<CheckpointWrite>;

    // Event log
    async fn append_event(
        &self,
        task_id: Option<&str>,
        event_type: &str,
        payload: Payload,
        correlation_id: Option<&str>,
    ) -> StoreResult<Event>;
    async fn list_events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Event>>;
    async fn latest_event(&self, task_id: &str, event_type: &str) -> StoreResult<Option<Event>>;
}

/// Runnable ordering shared by every engine: priority desc, due time asc with
/// unscheduled tasks first, then least recently updated.
pub fn runnable_order(a: &PdcaTask, b: &PdcaTask) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.next_run_at, b.next_run_at) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.updated_at.cmp(&b.updated_at))
}

pub fn is_runnable(task: &PdcaTask, now: DateTime<Utc>) -> bool {
    task.status.is_schedulable() && task.is_due_at(now) && !task.is_leased_at(now)
}
