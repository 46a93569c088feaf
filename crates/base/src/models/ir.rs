use core::fmt;
use core::str::FromStr;

use strata_core::{OrmError, Value};
use strata_orm::{Field, ModelDef, OnDelete};

use super::{ACCESS, GROUPS, MODEL, MODEL_DATA, MODULE, MODULES, RULE};

pub(super) fn defs() -> Vec<ModelDef> {
    vec![model(), model_data(), module(), access(), rule()]
}

fn model() -> ModelDef {
    ModelDef::new(MODEL)
        .in_module(MODULE)
        .description("Models")
        .order("model")
        .field(Field::char("name").string("Model Description").required().translate())
        .field(Field::char("model").required().index())
        .field(Field::text("info").string("Information"))
        .field(Field::char("modules").string("In Apps").help("Modules contributing to the model, in load order"))
        .field(Field::integer("field_count").string("Fields"))
        .field(Field::boolean("abstract").string("Abstract Model"))
        .unique("obj_name_uniq", &["model"], "Each model must have a unique name.")
}

fn model_data() -> ModelDef {
    ModelDef::new(MODEL_DATA)
        .in_module(MODULE)
        .description("Model Data")
        .order("module, model, name")
        .field(Field::char("name").string("External Identifier").required().index())
        .field(Field::char("module").required().index())
        .field(Field::char("model").string("Model Name").required())
        .field(Field::integer("res_id").string("Record ID").index())
        .field(Field::boolean("noupdate").string("Non Updatable"))
        .field(Field::char("complete_name").compute(&["module", "name"], |data| {
            let module = data.get_text("module")?.unwrap_or_default();
            let name = data.get_text("name")?.unwrap_or_default();
            Ok(Value::Text(format!("{module}.{name}")))
        }))
        .unique(
            "name_nospaces",
            &["module", "name"],
            "You cannot have multiple records with the same external ID in the same module!",
        )
        .constraint("check_name", &["name", "module"], |rows| {
            for row in rows.iter() {
                let name = row.get_text("name")?.unwrap_or_default();
                if name.contains(char::is_whitespace) || name.contains('.') {
                    return Err(OrmError::validation(format!(
                        "external identifier '{name}' may contain neither spaces nor dots"
                    )));
                }
            }
            Ok(())
        })
}

/// Lifecycle state of an addon in `ir.module.module`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleState {
    Uninstallable,
    Uninstalled,
    ToInstall,
    ToUpgrade,
    ToRemove,
    Installed,
}

impl ModuleState {
    pub const ALL: [ModuleState; 6] = [
        ModuleState::Uninstallable,
        ModuleState::Uninstalled,
        ModuleState::ToInstall,
        ModuleState::ToUpgrade,
        ModuleState::ToRemove,
        ModuleState::Installed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Uninstallable => "uninstallable",
            ModuleState::Uninstalled => "uninstalled",
            ModuleState::ToInstall => "to install",
            ModuleState::ToUpgrade => "to upgrade",
            ModuleState::ToRemove => "to remove",
            ModuleState::Installed => "installed",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ModuleState::Uninstallable => "Uninstallable",
            ModuleState::Uninstalled => "Not Installed",
            ModuleState::ToInstall => "To be installed",
            ModuleState::ToUpgrade => "To be upgraded",
            ModuleState::ToRemove => "To be removed",
            ModuleState::Installed => "Installed",
        }
    }

    /// Installed, possibly with a pending upgrade or removal.
    pub fn is_installed(self) -> bool {
        matches!(
            self,
            ModuleState::Installed | ModuleState::ToUpgrade | ModuleState::ToRemove
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleState {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| OrmError::validation(format!("unknown module state '{s}'")))
    }
}

fn module() -> ModelDef {
    let states: Vec<(&str, &str)> = ModuleState::ALL
        .iter()
        .map(|s| (s.as_str(), s.label()))
        .collect();
    ModelDef::new(MODULES)
        .in_module(MODULE)
        .description("Module")
        .order("application desc, name")
        .field(Field::char("name").string("Technical Name").required().index())
        .field(Field::char("shortdesc").string("Module Name"))
        .field(Field::char("summary"))
        .field(Field::char("latest_version").string("Installed Version"))
        .field(Field::char("published_version").string("Available Version"))
        .field(Field::text("dependencies").help("Comma-separated names of the required modules"))
        .field(Field::selection("state", &states).string("Status").default(ModuleState::Uninstalled.as_str()))
        .field(Field::boolean("demo").string("Demo Data"))
        .field(Field::boolean("application"))
        .field(Field::boolean("auto_install").string("Automatic Installation"))
        .unique("name_uniq", &["name"], "The name of the module must be unique!")
}

fn access() -> ModelDef {
    ModelDef::new(ACCESS)
        .in_module(MODULE)
        .description("Model Access")
        .order("model_id, group_id, name")
        .field(Field::char("name").required().index())
        .field(Field::boolean("active").default(true))
        .field(
            Field::many2one("model_id", MODEL)
                .string("Model")
                .required()
                .index()
                .on_delete(OnDelete::Cascade),
        )
        .field(
            Field::many2one("group_id", GROUPS)
                .string("Group")
                .index()
                .on_delete(OnDelete::Cascade),
        )
        .field(Field::boolean("perm_read").string("Read Access"))
        .field(Field::boolean("perm_write").string("Write Access"))
        .field(Field::boolean("perm_create").string("Create Access"))
        .field(Field::boolean("perm_unlink").string("Delete Access"))
}

fn rule() -> ModelDef {
    ModelDef::new(RULE)
        .in_module(MODULE)
        .description("Record Rule")
        .order("model_id desc, id")
        .field(Field::char("name").index())
        .field(Field::boolean("active").default(true))
        .field(
            Field::many2one("model_id", MODEL)
                .string("Model")
                .required()
                .index()
                .on_delete(OnDelete::Cascade),
        )
        .field(
            Field::many2many("groups", GROUPS)
                .relation("rule_group_rel", "rule_group_id", "group_id"),
        )
        .field(
            Field::text("domain_force")
                .string("Domain")
                .help("Expression evaluated with user, uid, company_id and company_ids in scope"),
        )
        .field(Field::boolean("perm_read").string("Apply for Read").default(true))
        .field(Field::boolean("perm_write").string("Apply for Write").default(true))
        .field(Field::boolean("perm_create").string("Apply for Create").default(true))
        .field(Field::boolean("perm_unlink").string("Apply for Delete").default(true))
        .field(
            Field::boolean("global")
                .compute(&["groups"], |rule| {
                    Ok(Value::Bool(rule.get("groups")?.as_ids().is_empty()))
                })
                .store(true),
        )
        .constraint("check_perms", &["perm_read", "perm_write", "perm_create", "perm_unlink"], |rules| {
            for rule in rules.iter() {
                let any = ["perm_read", "perm_write", "perm_create", "perm_unlink"]
                    .into_iter()
                    .map(|f| rule.get(f).map(|v| v.is_truthy()))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .any(|b| b);
                if !any {
                    return Err(OrmError::validation(
                        "a rule must apply to at least one of read, write, create or delete",
                    ));
                }
            }
            Ok(())
        })
}
