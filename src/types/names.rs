//! Well-known signal and event type names shared by the dispatcher, the queue
//! runner and the slice-executing collaborators.

pub const SIGNAL_SLICE_REQUESTED: &str = "pdca.slice.requested";
pub const SIGNAL_ACTION_SUCCEEDED: &str = "action.succeeded";
pub const SIGNAL_ACTION_FAILED: &str = "action.failed";

pub const EVENT_SLICE_REQUESTED: &str = "slice.requested";
pub const EVENT_SLICE_COMPLETED_DONE: &str = "slice.completed.done";
pub const EVENT_SLICE_COMPLETED_FAILED: &str = "slice.completed.failed";
pub const EVENT_SLICE_COMPLETED_WAITING_USER: &str = "slice.completed.waiting_user";
pub const EVENT_SLICE_COMPLETED_QUEUED: &str = "slice.completed.queued";
pub const EVENT_SLICE_FAILED: &str = "slice.failed";
pub const EVENT_SLICE_BLOCKED_MISSING_TEXT: &str = "slice.blocked.missing_text";
pub const EVENT_SLICE_BLOCKED_BUDGET: &str = "slice.blocked.budget_exhausted";
pub const EVENT_STARVATION_WARNING: &str = "queue.starvation_warning";
pub const EVENT_SIGNAL_EMITTED: &str = "signal.emitted";

pub const DISPATCHER_SOURCE: &str = "dispatcher";
pub const QUEUE_RUNNER_SOURCE: &str = "queue_runner";
