use serde::{Deserialize, Serialize};

use super::StateId;

/// A named position in the control-plane state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub key: String,
    pub name: String,
    pub enabled: bool,
}

/// A persisted `(state, signal) -> action / next state` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state_key: String,
    pub signal_key: String,
    #[serde(default)]
    pub action_key: Option<String>,
    #[serde(default)]
    pub next_state_key: Option<String>,
}

/// Result of looking up a `(state, signal)` pair. Unmatched pairs are a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub matched: bool,
    pub action_key: Option<String>,
    pub next_state_key: Option<String>,
}

impl Outcome {
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            action_key: None,
            next_state_key: None,
        }
    }

    pub fn matched(action_key: Option<String>, next_state_key: Option<String>) -> Self {
        Self {
            matched: true,
            action_key,
            next_state_key,
        }
    }
}
