use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::storage::{StoreResult, TaskStore};
use crate::types::names::{
    EVENT_SLICE_BLOCKED_BUDGET, EVENT_SLICE_BLOCKED_MISSING_TEXT, EVENT_SLICE_COMPLETED_DONE,
    EVENT_SLICE_COMPLETED_FAILED, EVENT_SLICE_COMPLETED_WAITING_USER, EVENT_SLICE_FAILED,
    EVENT_SLICE_REQUESTED, EVENT_STARVATION_WARNING,
};
use crate::types::{Event, OwnerId, PdcaTask, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutcomes {
    pub done: u64,
    pub waiting_user: u64,
    pub failed: u64,
}

/// Point-in-time operational view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub generated_at: DateTime<Utc>,
    pub lookback_minutes: u32,
    pub queue_depth_total: u64,
    pub queue_depth_by_status: BTreeMap<String, u64>,
    pub queue_depth_by_owner: BTreeMap<OwnerId, u64>,
    pub oldest_wait_seconds: i64,
    pub oldest_wait_seconds_by_owner: BTreeMap<OwnerId, i64>,
    pub dispatch_rate_per_minute: f64,
    pub dispatch_rate_per_minute_by_owner: BTreeMap<OwnerId, f64>,
    pub budget_exhaustions_total: u64,
    pub budget_exhaustions_by_reason: BTreeMap<String, u64>,
    pub starvation_warnings_total: u64,
    pub owner_fairness_ratio: BTreeMap<OwnerId, f64>,
    pub terminal_outcomes_total: TerminalOutcomes,
}

/// Which terminal bucket a completion-family event counts towards.
pub fn classify_terminal(event_type: &str) -> Option<TaskStatus> {
    match event_type {
        EVENT_SLICE_COMPLETED_DONE => Some(TaskStatus::Done),
        EVENT_SLICE_COMPLETED_WAITING_USER | EVENT_SLICE_BLOCKED_MISSING_TEXT => {
            Some(TaskStatus::WaitingUser)
        }
        EVENT_SLICE_COMPLETED_FAILED | EVENT_SLICE_FAILED | EVENT_SLICE_BLOCKED_BUDGET => {
            Some(TaskStatus::Failed)
        }
        _ => None,
    }
}

/// Reads the task census and the event log from `now - lookback_minutes`. Never writes.
pub async fn get_metrics<S>(store: &S, now: DateTime<Utc>, lookback_minutes: u32) -> StoreResult<QueueMetrics>
where
    S: TaskStore + ?Sized,
{
    let lookback_minutes = lookback_minutes.max(1);
    let tasks = store.list_tasks().await?;
    let since = now - Duration::minutes(i64::from(lookback_minutes));
    let events = store.list_events_since(since).await?;

    Ok(compute_metrics(&tasks, &events, now, lookback_minutes))
}

pub fn compute_metrics(
    tasks: &[PdcaTask],
    events: &[Event],
    now: DateTime<Utc>,
    lookback_minutes: u32,
) -> QueueMetrics {
    let lookback_minutes = lookback_minutes.max(1);
    let mut metrics = QueueMetrics {
        generated_at: now,
        lookback_minutes,
        queue_depth_total: tasks.len() as u64,
        ..QueueMetrics::default()
    };

    for status in TaskStatus::ALL {
        metrics
            .queue_depth_by_status
            .insert(status.as_str().to_string(), 0);
    }

    let mut owners: HashMap<&str, &str> = HashMap::new();
    let mut active_by_owner: HashMap<&str, u64> = HashMap::new();
    for task in tasks {
        owners.insert(task.task_id.as_str(), task.owner_id.as_str());
        *metrics
            .queue_depth_by_status
            .entry(task.status.as_str().to_string())
            .or_default() += 1;
        *metrics
            .queue_depth_by_owner
            .entry(task.owner_id.clone())
            .or_default() += 1;

        if !task.status.is_terminal() {
            *active_by_owner.entry(task.owner_id.as_str()).or_default() += 1;
        }

        if let Some(wait) = task.wait_seconds(now) {
            metrics.oldest_wait_seconds = metrics.oldest_wait_seconds.max(wait);
            let owner_wait = metrics
                .oldest_wait_seconds_by_owner
                .entry(task.owner_id.clone())
                .or_default();
            *owner_wait = (*owner_wait).max(wait);
        }
    }

    let mut dispatches_total = 0u64;
    let mut dispatches_by_owner: BTreeMap<OwnerId, u64> = BTreeMap::new();
    for event in events {
        match event.event_type.as_str() {
            EVENT_SLICE_REQUESTED => {
                dispatches_total += 1;
                let owner = event
                    .task_id
                    .as_deref()
                    .and_then(|id| owners.get(id).copied())
                    .or_else(|| event.payload_str("owner_id"));
                if let Some(owner) = owner {
                    *dispatches_by_owner.entry(owner.to_string()).or_default() += 1;
                }
            }
            EVENT_STARVATION_WARNING => metrics.starvation_warnings_total += 1,
            _ => {}
        }

        if event.event_type == EVENT_SLICE_BLOCKED_BUDGET {
            metrics.budget_exhaustions_total += 1;
            let reason = event.payload_str("reason").unwrap_or("unknown");
            *metrics
                .budget_exhaustions_by_reason
                .entry(reason.to_string())
                .or_default() += 1;
        }

        match classify_terminal(&event.event_type) {
            Some(TaskStatus::Done) => metrics.terminal_outcomes_total.done += 1,
            Some(TaskStatus::WaitingUser) => metrics.terminal_outcomes_total.waiting_user += 1,
            Some(TaskStatus::Failed) => metrics.terminal_outcomes_total.failed += 1,
            _ => {}
        }
    }

    let minutes = f64::from(lookback_minutes);
    metrics.dispatch_rate_per_minute = dispatches_total as f64 / minutes;
    metrics.dispatch_rate_per_minute_by_owner = dispatches_by_owner
        .iter()
        .map(|(owner, count)| (owner.clone(), *count as f64 / minutes))
        .collect();

    let active_total: u64 = active_by_owner.values().sum();
    for (owner, active) in &active_by_owner {
        let ratio = if dispatches_total == 0 || active_total == 0 {
            0.0
        } else {
            let dispatched = dispatches_by_owner.get(*owner).copied().unwrap_or(0);
            let dispatch_share = dispatched as f64 / dispatches_total as f64;
            let backlog_share = *active as f64 / active_total as f64;
            dispatch_share / backlog_share
        };
        metrics.owner_fairness_ratio.insert(owner.to_string(), ratio);
    }

    metrics
}
