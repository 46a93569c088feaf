//! Tracing and logging setup shared by the server binary and tests.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat, init};
