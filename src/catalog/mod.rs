mod schema;
mod session;
mod table;

pub use schema::Catalog;
pub use session::{Session, SessionRegistry};
pub use table::Table;
