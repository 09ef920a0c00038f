use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Signal, State};

/// What an action handler sees: the triggering signal and the state it arrived in.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub signal: &'a Signal,
    pub current_state: &'a State,
}

/// Host-provided side effect resolved through the state table's `action_key`.
///
/// Handlers are awaited in-line by the dispatcher; an `Err` becomes an
/// `action.failed` signal and never stops the loop.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: ActionContext<'_>) -> Result<Value>;
}

/// Adapter for plain synchronous functions.
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Signal, &State) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ActionHandler for FnAction<F>
where
    F: Fn(&Signal, &State) -> Result<Value> + Send + Sync,
{
    async fn handle(&self, ctx: ActionContext<'_>) -> Result<Value> {
        (self.f)(ctx.signal, ctx.current_state)
    }
}

/// Explicitly constructed `action_key -> handler` mapping handed to the dispatcher.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_key: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action_key = action_key.into();
        if self.handlers.insert(action_key.clone(), handler).is_some() {
            log::warn!("action handler replaced for key={}", action_key);
        }
    }

    pub fn with(mut self, action_key: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(action_key, handler);
        self
    }

    pub fn get(&self, action_key: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_key).cloned()
    }

    pub fn contains(&self, action_key: &str) -> bool {
        self.handlers.contains_key(action_key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
