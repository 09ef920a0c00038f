use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::actions::{ActionContext, ActionRegistry};
use super::bus::{SignalBus, SignalReceiver};
use super::state_table::{StateTable, StateTableError};
use crate::types::names::{DISPATCHER_SOURCE, SIGNAL_ACTION_FAILED, SIGNAL_ACTION_SUCCEEDED};
use crate::types::{Payload, Signal, State};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long to wait for a signal before running a housekeeping tick
    pub tick_interval_ms: u64,
    /// Outcome signals deeper than this are suppressed
    pub max_depth: u64,
    /// Overrides the state table's initial state
    pub initial_state: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_depth: 8,
            initial_state: None,
        }
    }
}

/// Periodic maintenance run on dispatcher ticks. Never changes the current state.
#[async_trait]
pub trait Housekeeper: Send + Sync {
    fn name(&self) -> &str;
    async fn tick(&self) -> Result<()>;
}

/// What a single dispatch did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReport {
    /// No transition for this signal in the current state; nothing happened.
    Unmatched,
    /// Transition without an action.
    Transitioned { from: String, to: String },
    ActionSucceeded {
        action_key: String,
        from: String,
        to: String,
        emitted: bool,
    },
    /// The state did not change.
    ActionFailed {
        action_key: String,
        state: String,
        error: String,
        emitted: bool,
    },
}

/// Single-consumer control loop over the state table.
///
/// Dispatching is deterministic given the table, the registry and the signal
/// stream, so it can be driven directly in tests through [`Dispatcher::dispatch`].
pub struct Dispatcher {
    table: Arc<StateTable>,
    registry: ActionRegistry,
    bus: SignalBus,
    config: DispatcherConfig,
    current: State,
    housekeepers: Vec<Arc<dyn Housekeeper>>,
    ticks: u64,
}

impl Dispatcher {
    pub fn new(
        table: Arc<StateTable>,
        registry: ActionRegistry,
        bus: SignalBus,
        config: DispatcherConfig,
    ) -> Result<Self, StateTableError> {
        let current = match &config.initial_state {
            Some(key) => table
                .state(key)
                .cloned()
                .ok_or_else(|| StateTableError::UnknownInitialState(key.clone()))?,
            None => table.initial_state().clone(),
        };

        Ok(Self {
            table,
            registry,
            bus,
            config,
            current,
            housekeepers: Vec::new(),
            ticks: 0,
        })
    }

    pub fn with_housekeeper(mut self, housekeeper: Arc<dyn Housekeeper>) -> Self {
        self.housekeepers.push(housekeeper);
        self
    }

    pub fn current_state(&self) -> &State {
        &self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_interval_ms.max(1))
    }

    /// Routes one signal through the state table.
    pub async fn dispatch(&mut self, signal: Signal) -> DispatchReport {
        let outcome = self.table.lookup(self.current.id, signal.signal_type());
        if !outcome.matched {
            log::debug!(
                "unmatched signal type={} state={} id={}",
                signal.signal_type(),
                self.current.key,
                signal.id()
            );
            return DispatchReport::Unmatched;
        }

        let from = self.current.key.clone();
        let Some(action_key) = outcome.action_key else {
            let to = self.advance(outcome.next_state_key.as_deref());
            log::info!(
                "transition {} -> {} on {}",
                from,
                to,
                signal.signal_type()
            );
            return DispatchReport::Transitioned { from, to };
        };

        let result = match self.registry.get(&action_key) {
            Some(handler) => {
                handler
                    .handle(ActionContext {
                        signal: &signal,
                        current_state: &self.current,
                    })
                    .await
            }
            None => Err(anyhow::anyhow!(
                "no handler registered for action {}",
                action_key
            )),
        };

        match result {
            Ok(output) => {
                let to = self.advance(outcome.next_state_key.as_deref());
                log::info!(
                    "action {} succeeded, transition {} -> {} correlation_id={}",
                    action_key,
                    from,
                    to,
                    signal.correlation_id()
                );

                let mut fields = Payload::new();
                fields.insert("action_key".into(), json!(action_key));
                fields.insert("state".into(), json!(from));
                fields.insert("next_state".into(), json!(to));
                fields.insert("output".into(), output);
                let emitted = self
                    .emit_outcome(SIGNAL_ACTION_SUCCEEDED, &signal, fields)
                    .await;

                DispatchReport::ActionSucceeded {
                    action_key,
                    from,
                    to,
                    emitted,
                }
            }
            Err(error) => {
                let error = format!("{:#}", error);
                log::warn!(
                    "action {} failed in state {}: {} correlation_id={}",
                    action_key,
                    from,
                    error,
                    signal.correlation_id()
                );

                let mut fields = Payload::new();
                fields.insert("action_key".into(), json!(action_key));
                fields.insert("state".into(), json!(from));
                fields.insert("error".into(), json!(error));
                let emitted = self.emit_outcome(SIGNAL_ACTION_FAILED, &signal, fields).await;

                DispatchReport::ActionFailed {
                    action_key,
                    state: from,
                    error,
                    emitted,
                }
            }
        }
    }

    /// Moves to `next_state_key`, staying put when it is absent. Returns the new key.
    fn advance(&mut self, next_state_key: Option<&str>) -> String {
        if let Some(next) = next_state_key.and_then(|key| self.table.state(key)) {
            self.current = next.clone();
        }
        self.current.key.clone()
    }

    async fn emit_outcome(&self, signal_type: &str, trigger: &Signal, mut fields: Payload) -> bool {
        let depth = trigger.depth().saturating_add(1);
        if depth > self.config.max_depth {
            log::warn!(
                "depth breaker: suppressed {} at depth {} (max {}) correlation_id={}",
                signal_type,
                depth,
                self.config.max_depth,
                trigger.correlation_id()
            );
            return false;
        }

        fields.insert("depth".into(), json!(depth));
        fields.insert(
            "trigger_signal_id".into(),
            Value::String(trigger.id().to_string()),
        );
        fields.insert("trigger_type".into(), json!(trigger.signal_type()));
        if let Some(task_id) = trigger.payload().get("task_id") {
            fields.insert("task_id".into(), task_id.clone());
        }

        let signal = Signal::new(signal_type)
            .with_payload(fields)
            .with_source(DISPATCHER_SOURCE)
            .with_correlation_id(trigger.correlation_id());

        match self.bus.emit(signal).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("failed to emit {}: {}", signal_type, e);
                false
            }
        }
    }

    /// Housekeeping pass between signals.
    pub async fn tick(&mut self) {
        self.ticks += 1;
        for housekeeper in &self.housekeepers {
            if let Err(e) = housekeeper.tick().await {
                log::warn!("housekeeper {} failed: {:#}", housekeeper.name(), e);
            }
        }
    }

    /// Drives the loop until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(
        &mut self,
        mut receiver: SignalReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        log::info!(
            "dispatcher started in state {} (tick {:?}, max depth {})",
            self.current.key,
            self.tick_interval(),
            self.config.max_depth
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let interval = self.tick_interval();
            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = receiver.receive(interval) => received,
            };

            match received {
                Some(signal) => {
                    self.dispatch(signal).await;
                }
                None => self.tick().await,
            }
        }

        log::info!(
            "dispatcher stopped in state {} after {} ticks",
            self.current.key,
            self.ticks
        );
        Ok(())
    }
}
