use super::traits::{StoreError, StoreResult, TaskStore};
use crate::types::{CheckpointWrite, Payload};

/// Read-modify-write of a task checkpoint under optimistic concurrency.
///
/// `apply` receives the current `(state, task_state)` (empty maps when no checkpoint
/// exists yet) and returns the replacement pair. On a version conflict the checkpoint
/// is re-read and `apply` runs again, up to `max_attempts` times; after that the
/// conflict is surfaced as [`StoreError::CheckpointConflict`]. Returns the new version.
pub async fn update_checkpoint<S, F>(
    store: &S,
    task_id: &str,
    max_attempts: usize,
    mut apply: F,
) -> StoreResult<i64>
where
    S: TaskStore + ?Sized,
    F: FnMut(&Payload, &Payload) -> (Payload, Payload),
{
    let mut last_conflict = None;

    for attempt in 1..=max_attempts.max(1) {
        let current = store.get_checkpoint(task_id).await?;
        let (version, state, task_state) = match &current {
            Some(cp) => (cp.version, cp.state.clone(), cp.task_state.clone()),
            None => (0, Payload::new(), Payload::new()),
        };

        let (next_state, next_task_state) = apply(&state, &task_state);
        match store
            .save_checkpoint(task_id, next_state, next_task_state, version)
            .await?
        {
            CheckpointWrite::Saved { version } => return Ok(version),
            CheckpointWrite::Conflict { current_version } => {
                log::debug!(
                    "checkpoint conflict task_id={} attempt={} expected={} stored={}",
                    task_id,
                    attempt,
                    version,
                    current_version
                );
                last_conflict = Some((version, current_version));
            }
        }
    }

    let (expected, current) = last_conflict.unwrap_or((0, 0));
    Err(StoreError::CheckpointConflict {
        task_id: task_id.to_string(),
        expected,
        current,
    })
}
