use super::schema::{StateDefinition, StateTableDefinition};
use crate::types::names::{SIGNAL_ACTION_FAILED, SIGNAL_ACTION_SUCCEEDED, SIGNAL_SLICE_REQUESTED};
use crate::types::Transition;

pub const STATE_IDLE: &str = "idle";
pub const STATE_WORKING: &str = "working";
pub const STATE_DEGRADED: &str = "degraded";

pub const ACTION_RUN_SLICE: &str = "run_slice";

/// Built-in control plane used when no state table is provisioned.
///
/// Every state routes `pdca.slice.requested` to the `run_slice` action. A failed
/// action moves the agent to `degraded` until the next success brings it back to `idle`.
pub fn control_plane_definition() -> StateTableDefinition {
    let route = |state: &str, signal: &str, action: Option<&str>, next: &str| Transition {
        state_key: state.to_string(),
        signal_key: signal.to_string(),
        action_key: action.map(str::to_string),
        next_state_key: Some(next.to_string()),
    };

    StateTableDefinition {
        initial_state: STATE_IDLE.to_string(),
        states: vec![
            StateDefinition::new(STATE_IDLE, "Idle"),
            StateDefinition::new(STATE_WORKING, "Working"),
            StateDefinition::new(STATE_DEGRADED, "Degraded"),
        ],
        transitions: vec![
            route(STATE_IDLE, SIGNAL_SLICE_REQUESTED, Some(ACTION_RUN_SLICE), STATE_WORKING),
            route(STATE_IDLE, SIGNAL_ACTION_FAILED, None, STATE_DEGRADED),
            route(STATE_WORKING, SIGNAL_SLICE_REQUESTED, Some(ACTION_RUN_SLICE), STATE_WORKING),
            route(STATE_WORKING, SIGNAL_ACTION_SUCCEEDED, None, STATE_IDLE),
            route(STATE_WORKING, SIGNAL_ACTION_FAILED, None, STATE_DEGRADED),
            route(STATE_DEGRADED, SIGNAL_SLICE_REQUESTED, Some(ACTION_RUN_SLICE), STATE_WORKING),
            route(STATE_DEGRADED, SIGNAL_ACTION_SUCCEEDED, None, STATE_IDLE),
        ],
    }
}
