//! `strata-loader`: brings a database in line with a set of installed modules.
//!
//! Addons come from an [`AddonCatalog`]: compiled-in [`StaticAddon`]s and
//! data-only [`DirAddon`]s found on an addons path. The [`ModuleLoader`]
//! orders them by dependency, builds the registry for each step, reconciles
//! the schema and plays the data files, one transaction per module.

pub mod addon;
pub mod apply;
pub mod data;
pub mod error;
pub mod graph;
pub mod loader;
pub mod manifest;
pub mod report;

pub use addon::{Addon, AddonCatalog, DirAddon, StaticAddon, base_addon};
pub use apply::{ApplyStats, DataApplier};
pub use data::{DataRecord, DataValue, parse_file};
pub use error::LoadError;
pub use loader::{LoadOptions, ModuleLoader};
pub use manifest::Manifest;
pub use report::{LoadReport, ModuleFailure};
