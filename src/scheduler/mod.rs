pub mod fairness;
pub mod metrics;
pub mod runner;
pub mod slice;

pub use metrics::{get_metrics, QueueMetrics, TerminalOutcomes};
pub use runner::{QueueRunner, RunnerConfig, TickReport};
pub use slice::{check_budget, record_slice_outcome, BudgetReason, SliceOutcome, SliceRequest};
