pub mod builtin;
pub mod schema;

pub use builtin::control_plane_definition;
pub use schema::{StateDefinition, StateTableDefinition};
