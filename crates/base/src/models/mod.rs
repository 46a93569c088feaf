//! Built-in models of the `base` addon.

mod ir;
mod res;

use strata_orm::ModelDef;

pub use ir::ModuleState;

/// Technical name of the addon.
pub const MODULE: &str = "base";

pub const USERS: &str = strata_orm::USERS_MODEL;
pub const GROUPS: &str = "res.groups";
pub const COMPANY: &str = "res.company";
pub const LANG: &str = "res.lang";
pub const MODEL: &str = "ir.model";
pub const MODEL_DATA: &str = strata_orm::MODEL_DATA;
pub const MODULES: &str = "ir.module.module";
pub const ACCESS: &str = "ir.model.access";
pub const RULE: &str = "ir.rule";

/// Every model contributed by `base`.
pub fn model_defs() -> Vec<ModelDef> {
    let mut defs = res::defs();
    defs.extend(ir::defs());
    defs
}
