//! Callback side of a slice: what the collaborator executing a
//! `pdca.slice.requested` signal reports back to the task store.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::storage::{StoreError, StoreResult, TaskStore};
use crate::types::names::{
    EVENT_SLICE_BLOCKED_BUDGET, EVENT_SLICE_BLOCKED_MISSING_TEXT, EVENT_SLICE_COMPLETED_DONE,
    EVENT_SLICE_COMPLETED_FAILED, EVENT_SLICE_COMPLETED_QUEUED,
    EVENT_SLICE_COMPLETED_WAITING_USER, EVENT_SLICE_FAILED, SIGNAL_SLICE_REQUESTED,
};
use crate::types::{OwnerId, Payload, PdcaTask, Signal, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetReason {
    MaxCyclesReached,
    TokenBudgetExhausted,
    RuntimeExceeded,
}

impl BudgetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetReason::MaxCyclesReached => "max_cycles_reached",
            BudgetReason::TokenBudgetExhausted => "token_budget_exhausted",
            BudgetReason::RuntimeExceeded => "runtime_exceeded",
        }
    }
}

/// How a slice ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    Done,
    /// More work remains; the task goes back to the queue.
    Queued,
    WaitingUser,
    /// The task itself failed.
    Failed { error: String },
    /// This slice failed; the task stays queued for another attempt.
    SliceFailed { error: String },
    MissingText,
    BudgetExhausted { reason: BudgetReason },
}

impl SliceOutcome {
    pub fn event_type(&self) -> &'static str {
        match self {
            SliceOutcome::Done => EVENT_SLICE_COMPLETED_DONE,
            SliceOutcome::Queued => EVENT_SLICE_COMPLETED_QUEUED,
            SliceOutcome::WaitingUser => EVENT_SLICE_COMPLETED_WAITING_USER,
            SliceOutcome::Failed { .. } => EVENT_SLICE_COMPLETED_FAILED,
            SliceOutcome::SliceFailed { .. } => EVENT_SLICE_FAILED,
            SliceOutcome::MissingText => EVENT_SLICE_BLOCKED_MISSING_TEXT,
            SliceOutcome::BudgetExhausted { .. } => EVENT_SLICE_BLOCKED_BUDGET,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            SliceOutcome::Done => TaskStatus::Done,
            SliceOutcome::Queued | SliceOutcome::SliceFailed { .. } => TaskStatus::Queued,
            SliceOutcome::WaitingUser | SliceOutcome::MissingText => TaskStatus::WaitingUser,
            SliceOutcome::Failed { .. } | SliceOutcome::BudgetExhausted { .. } => {
                TaskStatus::Failed
            }
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            SliceOutcome::Failed { error } | SliceOutcome::SliceFailed { error } => {
                Some(error.clone())
            }
            SliceOutcome::BudgetExhausted { reason } => Some(reason.as_str().to_string()),
            _ => None,
        }
    }
}

/// First budget the task has run out of, if any.
pub fn check_budget(task: &PdcaTask, elapsed_seconds: i64) -> Option<BudgetReason> {
    if task.max_cycles > 0 && task.slice_cycles >= task.max_cycles {
        return Some(BudgetReason::MaxCyclesReached);
    }
    if task.token_budget_remaining <= 0 {
        return Some(BudgetReason::TokenBudgetExhausted);
    }
    if task.max_runtime_seconds > 0 && elapsed_seconds >= task.max_runtime_seconds {
        return Some(BudgetReason::RuntimeExceeded);
    }
    None
}

/// Applies a slice result to the task and appends the matching completion event.
pub async fn record_slice_outcome<S>(
    store: &S,
    task_id: &str,
    outcome: SliceOutcome,
    correlation_id: Option<&str>,
) -> StoreResult<PdcaTask>
where
    S: TaskStore + ?Sized,
{
    let mut task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

    task.slice_cycles += 1;
    task.status = outcome.status();
    match &outcome {
        SliceOutcome::Failed { .. } | SliceOutcome::SliceFailed { .. } => {
            task.failure_streak += 1;
        }
        SliceOutcome::BudgetExhausted { .. } => {}
        _ => task.failure_streak = 0,
    }
    if let Some(error) = outcome.error() {
        task.last_error = Some(error);
    }
    let task = store.upsert(task).await?;

    let mut payload = Payload::new();
    payload.insert("owner_id".into(), json!(task.owner_id));
    payload.insert("status".into(), json!(task.status.as_str()));
    payload.insert("slice_cycles".into(), json!(task.slice_cycles));
    match &outcome {
        SliceOutcome::Failed { error } | SliceOutcome::SliceFailed { error } => {
            payload.insert("error".into(), json!(error));
        }
        SliceOutcome::BudgetExhausted { reason } => {
            payload.insert("reason".into(), json!(reason.as_str()));
        }
        _ => {}
    }
    store
        .append_event(Some(task_id), outcome.event_type(), payload, correlation_id)
        .await?;

    log::info!(
        "slice recorded task_id={} outcome={} status={}",
        task_id,
        outcome.event_type(),
        task.status
    );
    Ok(task)
}

/// Parsed `pdca.slice.requested` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRequest {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub conversation_key: String,
    pub session_id: String,
    pub correlation_id: String,
}

impl SliceRequest {
    /// `None` for other signal types or when `task_id` is missing.
    pub fn from_signal(signal: &Signal) -> Option<Self> {
        if signal.signal_type() != SIGNAL_SLICE_REQUESTED {
            return None;
        }
        let field = |key: &str| signal.payload_str(key).unwrap_or_default().to_string();

        let task_id = signal.payload_str("task_id")?.to_string();
        let correlation_id = signal
            .payload_str("correlation_id")
            .unwrap_or(signal.correlation_id())
            .to_string();
        Some(Self {
            task_id,
            owner_id: field("owner_id"),
            conversation_key: field("conversation_key"),
            session_id: field("session_id"),
            correlation_id,
        })
    }
}
