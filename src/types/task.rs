use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventId, OwnerId, Payload, TaskClass, TaskId, TaskStatus};

pub const DEFAULT_MAX_CYCLES: i64 = 12;
pub const DEFAULT_MAX_RUNTIME_SECONDS: i64 = 1800;
pub const DEFAULT_TOKEN_BUDGET: i64 = 50_000;

/// A long-running Plan-Do-Check-Act task executed in bounded slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdcaTask {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    #[serde(default)]
    pub conversation_key: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub slice_cycles: i64,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: i64,
    #[serde(default = "default_max_runtime")]
    pub max_runtime_seconds: i64,
    #[serde(default = "default_token_budget")]
    pub token_budget_remaining: i64,
    #[serde(default)]
    pub failure_streak: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Queued
}

fn default_max_cycles() -> i64 {
    DEFAULT_MAX_CYCLES
}

fn default_max_runtime() -> i64 {
    DEFAULT_MAX_RUNTIME_SECONDS
}

fn default_token_budget() -> i64 {
    DEFAULT_TOKEN_BUDGET
}

impl PdcaTask {
    pub fn new(
        task_id: impl Into<TaskId>,
        owner_id: impl Into<OwnerId>,
        conversation_key: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            conversation_key: conversation_key.into(),
            session_id: session_id.into(),
            status: TaskStatus::Queued,
            priority: 0,
            next_run_at: None,
            lease_until: None,
            worker_id: None,
            slice_cycles: 0,
            max_cycles: DEFAULT_MAX_CYCLES,
            max_runtime_seconds: DEFAULT_MAX_RUNTIME_SECONDS,
            token_budget_remaining: DEFAULT_TOKEN_BUDGET,
            failure_streak: 0,
            last_error: None,
            metadata: Payload::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = next_run_at;
        self
    }

    pub fn with_class(mut self, class: TaskClass) -> Self {
        self.metadata.insert(
            "task_class".to_string(),
            Value::String(class.as_str().to_string()),
        );
        self
    }

    /// `metadata.task_class`, when it names a known class.
    pub fn task_class(&self) -> Option<TaskClass> {
        match self.metadata.get("task_class").and_then(Value::as_str) {
            Some("interactive") => Some(TaskClass::Interactive),
            Some("background") => Some(TaskClass::Background),
            _ => None,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.task_class() == Some(TaskClass::Interactive)
    }

    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.map(|until| until > now).unwrap_or(false)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Seconds since the task became due; `None` when not yet due or unscheduled.
    pub fn wait_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let wait = (now - self.next_run_at?).num_seconds();
        (wait > 0).then_some(wait)
    }

    /// Clamps the counters that must never go negative.
    pub fn normalize(&mut self) {
        self.priority = self.priority.max(0);
        self.slice_cycles = self.slice_cycles.max(0);
        self.failure_streak = self.failure_streak.max(0);
    }
}

/// Versioned snapshot of a task's in-progress work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub state: Payload,
    pub task_state: Payload,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a version-guarded checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckpointWrite {
    Saved { version: i64 },
    Conflict { current_version: i64 },
}

impl CheckpointWrite {
    pub fn is_saved(&self) -> bool {
        matches!(self, CheckpointWrite::Saved { .. })
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub task_id: Option<TaskId>,
    pub event_type: String,
    pub payload: Payload,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        task_id: Option<TaskId>,
        event_type: impl Into<String>,
        payload: Payload,
        correlation_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new_v4(),
            task_id,
            event_type: event_type.into(),
            payload,
            correlation_id,
            created_at,
        }
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
