pub mod actions;
pub mod bus;
pub mod dispatcher;
pub mod state_table;
pub mod webhook;

pub use actions::{ActionContext, ActionHandler, ActionRegistry, FnAction};
pub use bus::{BusError, SignalBus, SignalReceiver};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig, Housekeeper};
pub use state_table::{StateTable, StateTableError};
pub use webhook::WebhookAction;
