pub mod checkpoint;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use checkpoint::update_checkpoint;
pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use traits::{StoreError, StoreResult, TaskStore};
