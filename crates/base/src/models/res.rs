use serde_json::json;
use strata_auth::hash_password;
use strata_core::value::DEFAULT_LANG;
use strata_core::{OrmError, Value};
use strata_orm::{Field, ModelDef, OnDelete};

use super::{COMPANY, GROUPS, LANG, MODULE, USERS};

pub(super) fn defs() -> Vec<ModelDef> {
    vec![company(), lang(), groups(), users()]
}

fn company() -> ModelDef {
    ModelDef::new(COMPANY)
        .in_module(MODULE)
        .description("Companies")
        .order("sequence, name")
        .parent_name("parent_id")
        .field(Field::char("name").string("Company Name").required())
        .field(Field::integer("sequence").default(10))
        .field(Field::many2one("parent_id", COMPANY).string("Parent Company").index())
        .field(Field::one2many("child_ids", COMPANY, "parent_id").string("Branches"))
        .field(Field::boolean("active").default(true))
        .unique("name_uniq", &["name"], "The company name must be unique!")
}

fn lang() -> ModelDef {
    ModelDef::new(LANG)
        .in_module(MODULE)
        .description("Languages")
        .order("active desc, name")
        .field(Field::char("name").required())
        .field(Field::char("code").string("Locale Code").size(16).required())
        .field(Field::char("iso_code").size(16))
        .field(
            Field::selection("direction", &[("ltr", "Left-to-Right"), ("rtl", "Right-to-Left")])
                .default("ltr"),
        )
        .field(Field::boolean("active"))
        .unique("code_uniq", &["code"], "The code of the language must be unique!")
        .unique("name_uniq", &["name"], "The name of the language must be unique!")
        .constraint("check_code", &["code"], |langs| {
            for lang in langs.iter() {
                let code = lang.get_text("code")?.unwrap_or_default();
                if code.trim().is_empty() || code.contains(char::is_whitespace) {
                    return Err(OrmError::validation(format!("invalid language code '{code}'")));
                }
            }
            Ok(())
        })
}

fn groups() -> ModelDef {
    ModelDef::new(GROUPS)
        .in_module(MODULE)
        .description("Access Groups")
        .order("name")
        .field(Field::char("name").required().translate())
        .field(Field::text("comment"))
        .field(
            Field::many2many("implied_ids", GROUPS)
                .relation("res_groups_implied_rel", "gid", "hid")
                .string("Inherits")
                .help("Users of this group automatically inherit those groups"),
        )
        .field(Field::many2many("users", USERS))
        .unique("name_uniq", &["name"], "The name of the group must be unique!")
}

fn users() -> ModelDef {
    ModelDef::new(USERS)
        .in_module(MODULE)
        .description("Users")
        .order("name, login")
        .field(Field::char("name").required())
        .field(Field::char("login").required().index())
        .field(
            Field::char("password")
                .string("Password")
                .help("Write-only: the stored form is a salted hash")
                .compute(&[], |_| Ok(Value::Text(String::new())))
                .inverse(|user, value| {
                    let Some(clear) = value.as_str().filter(|p| !p.is_empty()) else {
                        return Ok(());
                    };
                    user.sudo()
                        .write_json(json!({ "password_hash": hash_password(clear) }))
                }),
        )
        .field(
            Field::char("password_hash")
                .groups(&["base.group_system"])
                .copy(false),
        )
        .field(Field::boolean("active").default(true))
        .field(Field::char("lang").default(DEFAULT_LANG))
        .field(Field::char("tz"))
        .field(Field::many2many("groups_id", GROUPS).string("Groups"))
        .field(
            Field::many2one("company_id", COMPANY)
                .string("Company")
                .on_delete(OnDelete::Restrict),
        )
        .field(
            Field::many2many("company_ids", COMPANY)
                .relation("res_company_users_rel", "user_id", "cid")
                .string("Companies"),
        )
        .field(
            Field::boolean("share")
                .help("External user: not a member of the internal users group")
                .compute(&["groups_id"], |user| {
                    let internal = user.env().lookup_xmlid("base.group_user")?;
                    let groups = user.get("groups_id")?.as_ids();
                    Ok(Value::Bool(!internal.is_some_and(|(_, gid)| groups.contains(&gid))))
                })
                .store(true),
        )
        .unique("login_key", &["login"], "You can not have two users with the same login!")
        .constraint("check_company", &["company_id", "company_ids"], |users| {
            for user in users.iter() {
                let Some(company) = user.get("company_id")?.as_id() else {
                    continue;
                };
                let allowed = user.get("company_ids")?.as_ids();
                if !allowed.is_empty() && !allowed.contains(&company) {
                    return Err(OrmError::validation(format!(
                        "the company of user '{}' is not among its allowed companies",
                        user.get_text("login")?.unwrap_or_default()
                    )));
                }
            }
            Ok(())
        })
}
