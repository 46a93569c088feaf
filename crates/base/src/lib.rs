//! `strata-base`: the `base` addon.
//!
//! Users, groups, companies and languages; the metadata models the loader
//! and the access layer work with (`ir.model`, `ir.model.data`,
//! `ir.module.module`, `ir.model.access`, `ir.rule`); and the access policy
//! reading grants and record rules from those tables.

pub mod model_data;
pub mod models;
pub mod policy;
pub mod users;

use std::sync::Arc;

use strata_orm::AccessPolicy;

pub use model_data::{XmlIdEntry, model_xml_id, reflect_models};
pub use models::{MODULE, ModuleState, model_defs};
pub use policy::BaseAccessPolicy;
pub use users::{authenticate, set_password};

/// Manifest of the addon (`manifest.toml`).
pub const MANIFEST: &str = include_str!("../manifest.toml");

/// Data files of the addon, by path relative to the addon root.
pub const DATA_FILES: &[(&str, &str)] = &[
    ("data/base_data.xml", include_str!("../data/base_data.xml")),
    ("data/ir.model.access.csv", include_str!("../data/ir.model.access.csv")),
];

/// Access policy to build registries with once `base` is installed.
pub fn access_policy() -> Arc<dyn AccessPolicy> {
    Arc::new(BaseAccessPolicy::new())
}
