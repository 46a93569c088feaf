//! `strata-core`: shared building blocks of the model layer.
//!
//! This crate contains **pure** primitives (no storage or transport concerns):
//! the error model, identifiers, the scalar value model, the per-call context
//! and the safe expression evaluator used by data files and record rules.

pub mod context;
pub mod error;
pub mod eval;
pub mod id;
pub mod value;

pub use context::Context;
pub use error::{ErrorKind, OrmError, OrmResult};
pub use eval::{EmptyScope, EvalScope};
pub use id::{RecordId, SUPERUSER_ID, XmlId};
pub use value::Value;
