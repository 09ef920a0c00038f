use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::state_table::StateTableError;
use crate::types::{StateId, Transition};

/// Serializable form of the control-plane state machine, as provisioned in YAML
/// files or the `states`/`transitions` tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTableDefinition {
    pub initial_state: String,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    // Assigned from position when omitted
    #[serde(default)]
    pub id: Option<StateId>,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StateDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            key: key.into(),
            name: name.into(),
            enabled: true,
        }
    }
}

impl StateTableDefinition {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, StateTableError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, StateTableError> {
        let content = std::fs::read_to_string(path).map_err(|source| StateTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, StateTableError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
