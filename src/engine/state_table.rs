use std::collections::HashMap;
use thiserror::Error;

use crate::definitions::StateTableDefinition;
use crate::types::{Outcome, State, StateId};

#[derive(Debug, Error)]
pub enum StateTableError {
    #[error("failed to read state table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid state table yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate state key: {0}")]
    DuplicateState(String),

    #[error("duplicate state id: {0}")]
    DuplicateStateId(StateId),

    #[error("duplicate transition for state {state} on signal {signal}")]
    DuplicateTransition { state: String, signal: String },

    #[error("transition references unknown state: {0}")]
    UnknownState(String),

    #[error("initial state not defined: {0}")]
    UnknownInitialState(String),
}

/// `(state, signal) -> outcome` lookup, validated once at load time.
///
/// Lookups are total: pairs without a transition, and transitions out of a
/// disabled state, resolve to an unmatched outcome.
#[derive(Debug, Clone)]
pub struct StateTable {
    states: Vec<State>,
    by_key: HashMap<String, usize>,
    by_id: HashMap<StateId, usize>,
    transitions: HashMap<StateId, HashMap<String, Outcome>>,
    initial: usize,
}

impl StateTable {
    pub fn from_definition(def: StateTableDefinition) -> Result<Self, StateTableError> {
        let mut states = Vec::with_capacity(def.states.len());
        let mut by_key = HashMap::new();
        let mut by_id = HashMap::new();

        for (index, state_def) in def.states.into_iter().enumerate() {
            let id = state_def.id.unwrap_or(index as StateId + 1);
            if by_key.contains_key(&state_def.key) {
                return Err(StateTableError::DuplicateState(state_def.key));
            }
            if by_id.contains_key(&id) {
                return Err(StateTableError::DuplicateStateId(id));
            }

            let name = if state_def.name.is_empty() {
                state_def.key.clone()
            } else {
                state_def.name
            };
            by_key.insert(state_def.key.clone(), states.len());
            by_id.insert(id, states.len());
            states.push(State {
                id,
                key: state_def.key,
                name,
                enabled: state_def.enabled,
            });
        }

        let initial = *by_key
            .get(&def.initial_state)
            .ok_or_else(|| StateTableError::UnknownInitialState(def.initial_state.clone()))?;

        let mut transitions: HashMap<StateId, HashMap<String, Outcome>> = HashMap::new();
        for transition in def.transitions {
            let from = by_key
                .get(&transition.state_key)
                .map(|&i| states[i].id)
                .ok_or_else(|| StateTableError::UnknownState(transition.state_key.clone()))?;

            if let Some(next) = &transition.next_state_key {
                if !by_key.contains_key(next) {
                    return Err(StateTableError::UnknownState(next.clone()));
                }
            }

            let routes = transitions.entry(from).or_default();
            if routes.contains_key(&transition.signal_key) {
                return Err(StateTableError::DuplicateTransition {
                    state: transition.state_key,
                    signal: transition.signal_key,
                });
            }
            routes.insert(
                transition.signal_key,
                Outcome::matched(transition.action_key, transition.next_state_key),
            );
        }

        Ok(Self {
            states,
            by_key,
            by_id,
            transitions,
            initial,
        })
    }

    pub fn initial_state(&self) -> &State {
        &self.states[self.initial]
    }

    pub fn state(&self, key: &str) -> Option<&State> {
        self.by_key.get(key).map(|&i| &self.states[i])
    }

    pub fn state_by_id(&self, id: StateId) -> Option<&State> {
        self.by_id.get(&id).map(|&i| &self.states[i])
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.values().map(HashMap::len).sum()
    }

    pub fn lookup(&self, state_id: StateId, signal_key: &str) -> Outcome {
        match self.state_by_id(state_id) {
            Some(state) if state.enabled => self
                .transitions
                .get(&state_id)
                .and_then(|routes| routes.get(signal_key))
                .cloned()
                .unwrap_or_else(Outcome::unmatched),
            _ => Outcome::unmatched(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::StateDefinition;
    use crate::types::Transition;

    fn transition(state: &str, signal: &str, action: Option<&str>, next: Option<&str>) -> Transition {
        Transition {
            state_key: state.to_string(),
            signal_key: signal.to_string(),
            action_key: action.map(str::to_string),
            next_state_key: next.map(str::to_string),
        }
    }

    fn create_test_definition() -> StateTableDefinition {
        let mut off = StateDefinition::new("off", "Off");
        off.enabled = false;

        StateTableDefinition {
            initial_state: "idle".to_string(),
            states: vec![
                StateDefinition::new("idle", "Idle"),
                StateDefinition::new("busy", ""),
                off,
            ],
            transitions: vec![
                transition("idle", "work", Some("do_work"), Some("busy")),
                transition("busy", "done", None, Some("idle")),
                transition("off", "work", Some("do_work"), Some("busy")),
            ],
        }
    }

    #[test]
    fn test_lookup_matched() {
        let table = StateTable::from_definition(create_test_definition()).unwrap();
        let idle = table.initial_state();

        let outcome = table.lookup(idle.id, "work");
        assert_eq!(
            outcome,
            Outcome::matched(Some("do_work".to_string()), Some("busy".to_string()))
        );
    }

    #[test]
    fn test_lookup_unmatched_is_noop_outcome() {
        let table = StateTable::from_definition(create_test_definition()).unwrap();
        let idle = table.initial_state();

        assert_eq!(table.lookup(idle.id, "unknown.signal"), Outcome::unmatched());
        assert_eq!(table.lookup(999, "work"), Outcome::unmatched());
    }

    #[test]
    fn test_disabled_state_never_matches() {
        let table = StateTable::from_definition(create_test_definition()).unwrap();
        let off = table.state("off").unwrap();

        assert!(!off.enabled);
        assert!(!table.lookup(off.id, "work").matched);
    }

    #[test]
    fn test_ids_and_names_are_assigned() {
        let table = StateTable::from_definition(create_test_definition()).unwrap();

        assert_eq!(table.state("idle").unwrap().id, 1);
        assert_eq!(table.state("busy").unwrap().id, 2);
        assert_eq!(table.state("busy").unwrap().name, "busy");
        assert_eq!(table.state_by_id(2).unwrap().key, "busy");
        assert_eq!(table.transition_count(), 3);
    }

    #[test]
    fn test_rejects_unknown_states() {
        let mut def = create_test_definition();
        def.transitions
            .push(transition("idle", "jump", None, Some("nowhere")));
        assert!(matches!(
            StateTable::from_definition(def),
            Err(StateTableError::UnknownState(key)) if key == "nowhere"
        ));

        let mut def = create_test_definition();
        def.initial_state = "missing".to_string();
        assert!(matches!(
            StateTable::from_definition(def),
            Err(StateTableError::UnknownInitialState(_))
        ));
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut def = create_test_definition();
        def.states.push(StateDefinition::new("idle", "Again"));
        assert!(matches!(
            StateTable::from_definition(def),
            Err(StateTableError::DuplicateState(_))
        ));

        let mut def = create_test_definition();
        def.transitions
            .push(transition("idle", "work", None, Some("idle")));
        assert!(matches!(
            StateTable::from_definition(def),
            Err(StateTableError::DuplicateTransition { .. })
        ));
    }
}
