//! `strata-orm`: models, recordsets and the domain language.
//!
//! Modules contribute [`ModelDef`]s; a [`Registry`] folds them into final
//! [`Model`]s and derives the schema, the recomputation triggers and the
//! delete dependencies. All record operations go through a [`RecordSet`]
//! bound to an [`Env`] (one transaction, one user, one context).

pub mod access;
pub mod commands;
mod compiler;
pub mod domain;
pub mod env;
pub mod field;
pub mod model;
pub mod recordset;
pub mod registry;

pub use access::{AccessPolicy, AllowAll};
pub use commands::Command;
pub use domain::{Domain, Operator};
pub use env::{Env, MODEL_DATA};
pub use field::{Field, FieldDefault, FieldType, FieldValue};
pub use model::{Model, ModelDef, ModelKind, Super};
pub use recordset::{Mapped, RecordSet, SearchParams};
pub use registry::{Registry, Trigger, USERS_MODEL};

pub use strata_auth::AccessMode;
pub use strata_infra::store::OnDelete;
