pub mod api;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::Config;
pub use types::*;
