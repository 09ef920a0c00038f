use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::traits::{is_runnable, runnable_order, StoreError, StoreResult, TaskStore};
use crate::types::{Checkpoint, CheckpointWrite, Event, Payload, PdcaTask, TaskId, TaskStatus};

/// Process-local task store. Each conditional update runs under one write lock,
/// which is what makes leases and checkpoint versions atomic here.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, PdcaTask>>>,
    checkpoints: Arc<RwLock<HashMap<TaskId, Checkpoint>>>,
    events: Arc<RwLock<Vec<Event>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn event_count(&self) -> StoreResult<usize> {
        let events = self.events.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(events.len())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn upsert(&self, mut task: PdcaTask) -> StoreResult<PdcaTask> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        task.normalize();
        if let Some(existing) = tasks.get(&task.task_id) {
            task.created_at = existing.created_at;
        }
        task.updated_at = Utc::now();
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<PdcaTask>> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> StoreResult<Vec<PdcaTask>> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<PdcaTask> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PdcaTask>> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut runnable: Vec<PdcaTask> = tasks
            .values()
            .filter(|t| is_runnable(t, now))
            .cloned()
            .collect();
        runnable.sort_by(runnable_order);
        runnable.truncate(limit);
        Ok(runnable)
    }

    async fn acquire_lease(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.is_leased_at(now) {
            return Ok(false);
        }

        task.lease_until = Some(now + Duration::seconds(lease_seconds.max(0)));
        task.worker_id = Some(worker_id.to_string());
        if task.status == TaskStatus::Queued {
            task.status = TaskStatus::Running;
        }
        task.updated_at = now;
        Ok(true)
    }

    async fn release_lease(&self, task_id: &str, worker_id: &str) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.worker_id.as_deref() == Some(worker_id) {
                task.lease_until = None;
                task.worker_id = None;
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        match tasks.get_mut(task_id) {
            Some(task)
                if task.worker_id.as_deref() == Some(worker_id) && task.status.is_schedulable() =>
            {
                task.next_run_at = next_run_at;
                task.status = status;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(checkpoints.get(task_id).cloned())
    }

    async fn save_checkpoint(
        &self,
        task_id: &str,
        state: Payload,
        task_state: Payload,
        expected_version: i64,
    ) -> StoreResult<CheckpointWrite> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();

        match checkpoints.get_mut(task_id) {
            Some(existing) if existing.version != expected_version => Ok(CheckpointWrite::Conflict {
                current_version: existing.version,
            }),
            Some(existing) => {
                existing.state = state;
                existing.task_state = task_state;
                existing.version += 1;
                existing.updated_at = now;
                Ok(CheckpointWrite::Saved {
                    version: existing.version,
                })
            }
            None if expected_version != 0 => Ok(CheckpointWrite::Conflict { current_version: 0 }),
            None => {
                checkpoints.insert(
                    task_id.to_string(),
                    Checkpoint {
                        task_id: task_id.to_string(),
                        state,
                        task_state,
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(CheckpointWrite::Saved { version: 1 })
            }
        }
    }

    async fn append_event(
        &self,
        task_id: Option<&str>,
        event_type: &str,
        payload: Payload,
        correlation_id: Option<&str>,
    ) -> StoreResult<Event> {
        let mut events = self.events.write().map_err(|_| StoreError::LockPoisoned)?;
        let event = Event::new(
            task_id.map(str::to_string),
            event_type,
            payload,
            correlation_id.map(str::to_string),
            Utc::now(),
        );
        events.push(event.clone());
        Ok(event)
    }

    async fn list_events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        let events = self.events.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(events
            .iter()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect())
    }

    async fn latest_event(&self, task_id: &str, event_type: &str) -> StoreResult<Option<Event>> {
        let events = self.events.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(events
            .iter()
            .rev()
            .find(|e| e.task_id.as_deref() == Some(task_id) && e.event_type == event_type)
            .cloned())
    }
}
