use crate::types::PdcaTask;

/// `priority + interactive_boost` for interactive tasks, `priority` otherwise.
pub fn effective_priority(task: &PdcaTask, interactive_boost: i64) -> i64 {
    if task.is_interactive() {
        task.priority.saturating_add(interactive_boost)
    } else {
        task.priority
    }
}

/// Sorts candidates by effective priority, highest first. The sort is stable, so the
/// store's runnable order breaks ties.
pub fn sort_by_effective_priority(candidates: &mut [PdcaTask], interactive_boost: i64) {
    candidates.sort_by_key(|task| std::cmp::Reverse(effective_priority(task, interactive_boost)));
}

/// Moves the last dispatched owner's candidates behind every other owner's when any
/// other owner has work in the batch. Relative order within each group is kept, so the
/// last owner is still reached if every other candidate loses its lease.
pub fn apply_owner_fairness(candidates: Vec<PdcaTask>, last_owner: Option<&str>) -> Vec<PdcaTask> {
    let Some(last_owner) = last_owner else {
        return candidates;
    };
    let (repeat, others): (Vec<PdcaTask>, Vec<PdcaTask>) = candidates
        .into_iter()
        .partition(|task| task.owner_id == last_owner);
    if others.is_empty() {
        return repeat;
    }
    others.into_iter().chain(repeat).collect()
}

/// Candidate order for one runner tick.
pub fn order_candidates(
    mut candidates: Vec<PdcaTask>,
    interactive_boost: i64,
    last_owner: Option<&str>,
) -> Vec<PdcaTask> {
    sort_by_effective_priority(&mut candidates, interactive_boost);
    apply_owner_fairness(candidates, last_owner)
}
