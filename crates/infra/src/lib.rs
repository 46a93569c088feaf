//! Infrastructure layer: transactional storage and configuration.

pub mod config;
pub mod store;

pub use config::{ConfigError, ServerConfig};
pub use store::{Cursor, Database, Filter, StoreError, StoreResult};
