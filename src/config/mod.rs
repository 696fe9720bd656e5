//! Configuration: TOML schema and the lock-free store

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
