mod engine;
mod options;
mod registry;

pub use engine::{Database, DatabaseStats};
pub use options::{validate_properties, DatabaseOptions};
pub use registry::DatabaseRegistry;
