//! The persistence layer (§4.7): schema, and the session abstraction that
//! funnels every write through one lock.

mod schema;
mod session;

pub use schema::SCHEMA_SQL;
pub use session::{Session, SessionFactory};
