//! Access policy backed by `ir.model.access` and `ir.rule`.

use std::collections::BTreeSet;

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_auth::{
    AccessMode, AuthorizationExplanation, GroupGraph, ModelGrant, Principal, RecordRule,
    applicable_rules, check_model_access, explain_authorization,
};
use strata_core::eval::{self, EvalScope};
use strata_core::{OrmError, OrmResult, RecordId};
use strata_orm::{AccessPolicy, Domain, Env, Operator};
use tracing::debug;

use crate::models::{ACCESS, COMPANY, GROUPS, RULE, USERS};

/// Decides rights from the grant and rule tables of the database.
///
/// Nothing is cached: every decision reads the tables through the caller's
/// transaction, so grants written earlier in the same call already apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseAccessPolicy;

impl BaseAccessPolicy {
    pub fn new() -> Self {
        Self
    }

    /// The env's user with its effective groups and companies.
    pub fn principal(&self, env: &Env) -> OrmResult<Principal> {
        let sudo = env.sudo().with_context_value("active_test", false);
        let user = sudo.browse(USERS, [env.uid()])?;
        if user.exists()?.is_empty() {
            return Err(OrmError::access(format!("user {} does not exist", env.uid())));
        }
        let direct = user.get("groups_id")?.as_ids();

        let mut graph = GroupGraph::new();
        for group in sudo.model(GROUPS)?.search(&Domain::True)?.iter() {
            let gid = group.id()?;
            for implied in group.get("implied_ids")?.as_ids() {
                graph.imply(gid, implied);
            }
        }

        let mut principal = Principal::new(env.uid(), user.get_text("login")?.unwrap_or_default())
            .with_groups(graph.closure(direct));
        let allowed = user.get("company_ids")?.as_ids();
        let requested = env.context().company_ids();
        principal.company_ids = if requested.is_empty() {
            allowed
        } else {
            requested
                .into_iter()
                .filter(|c| allowed.is_empty() || allowed.contains(c))
                .collect()
        };
        principal.company_id = principal
            .company_ids
            .first()
            .copied()
            .or(user.get("company_id")?.as_id());
        principal.su = env.is_superuser();
        Ok(principal)
    }

    fn grants(&self, env: &Env, model: &str) -> OrmResult<Vec<ModelGrant>> {
        let rows = env
            .sudo()
            .model(ACCESS)?
            .search(&Domain::leaf("model_id.model", Operator::Eq, model))?;
        rows.iter()
            .map(|row| {
                Ok(ModelGrant {
                    name: row.get_text("name")?.unwrap_or_default(),
                    model: model.to_string(),
                    group: row.get("group_id")?.as_id(),
                    read: row.get("perm_read")?.is_truthy(),
                    write: row.get("perm_write")?.is_truthy(),
                    create: row.get("perm_create")?.is_truthy(),
                    unlink: row.get("perm_unlink")?.is_truthy(),
                })
            })
            .collect()
    }

    fn rules(&self, env: &Env, model: &str) -> OrmResult<Vec<RecordRule>> {
        let rows = env
            .sudo()
            .model(RULE)?
            .search(&Domain::leaf("model_id.model", Operator::Eq, model))?;
        rows.iter()
            .map(|row| {
                Ok(RecordRule {
                    id: row.id()?,
                    name: row.get_text("name")?.unwrap_or_default(),
                    model: model.to_string(),
                    groups: row.get("groups")?.as_ids(),
                    domain: row.get_text("domain_force")?.unwrap_or_default(),
                    read: row.get("perm_read")?.is_truthy(),
                    write: row.get("perm_write")?.is_truthy(),
                    create: row.get("perm_create")?.is_truthy(),
                    unlink: row.get("perm_unlink")?.is_truthy(),
                    active: row.get("active")?.is_truthy(),
                })
            })
            .collect()
    }

    /// Why `mode` on `model` is allowed or denied for the env's user.
    pub fn explain(&self, env: &Env, model: &str, mode: AccessMode) -> OrmResult<AuthorizationExplanation> {
        let principal = self.principal(env)?;
        Ok(explain_authorization(
            &principal,
            model,
            mode,
            &self.grants(env, model)?,
            &self.rules(env, model)?,
        ))
    }
}

/// Names visible to rule domains.
struct RuleScope<'a> {
    env: &'a Env,
    vars: JsonMap<String, JsonValue>,
}

impl<'a> RuleScope<'a> {
    fn new(env: &'a Env, principal: &Principal) -> OrmResult<Self> {
        let sudo = env.sudo().with_context_value("active_test", false);
        let user = sudo.browse(USERS, [principal.uid])?;
        let company = match principal.company_id {
            Some(id) => sudo.browse(COMPANY, [id])?.display_name()?,
            None => String::new(),
        };
        let mut vars = JsonMap::new();
        vars.insert(
            "user".into(),
            json!({
                "id": principal.uid,
                "login": principal.login,
                "name": user.get_text("name")?.unwrap_or_default(),
                "company_id": principal.company_id,
                "company_ids": principal.company_ids,
                "groups_id": principal.groups.iter().collect::<Vec<_>>(),
            }),
        );
        vars.insert("uid".into(), json!(principal.uid));
        vars.insert("company_id".into(), json!(principal.company_id));
        vars.insert("company_ids".into(), json!(principal.company_ids));
        vars.insert("company_name".into(), json!(company));
        Ok(Self { env, vars })
    }
}

impl EvalScope for RuleScope<'_> {
    fn lookup(&self, name: &str) -> Option<JsonValue> {
        self.vars.get(name).cloned()
    }

    fn call(&self, name: &str, args: &[JsonValue]) -> OrmResult<JsonValue> {
        match (name, args) {
            ("ref", [JsonValue::String(xml_id)]) => Ok(json!(self.env.ref_id(xml_id)?.1)),
            _ => Err(OrmError::validation(format!("unknown function '{name}' in record rule"))),
        }
    }
}

impl AccessPolicy for BaseAccessPolicy {
    fn check_model(&self, env: &Env, model: &str, mode: AccessMode) -> OrmResult<()> {
        let principal = self.principal(env)?;
        let grants = self.grants(env, model)?;
        check_model_access(&principal, model, mode, &grants).map_err(|err| {
            debug!(uid = principal.uid, model, %mode, "model access denied");
            OrmError::from(err)
        })
    }

    fn rule_domain(&self, env: &Env, model: &str, mode: AccessMode) -> OrmResult<Domain> {
        let principal = self.principal(env)?;
        let rules = self.rules(env, model)?;
        let applicable = applicable_rules(&principal, model, mode, &rules);
        if applicable.is_empty() {
            return Ok(Domain::True);
        }
        let scope = RuleScope::new(env, &principal)?;
        let mut domains = Vec::with_capacity(applicable.len());
        for rule in applicable {
            let source = rule.domain.trim();
            if source.is_empty() {
                continue;
            }
            let value = eval::evaluate(source, &scope).map_err(|err| {
                OrmError::validation(format!("invalid domain in record rule '{}': {err}", rule.name))
            })?;
            domains.push(Domain::from_json(&value)?);
        }
        Ok(Domain::and(domains))
    }

    fn user_groups(&self, env: &Env) -> OrmResult<BTreeSet<RecordId>> {
        Ok(self.principal(env)?.groups)
    }

    fn has_group(&self, env: &Env, xml_id: &str) -> OrmResult<bool> {
        let Some((_, gid)) = env.lookup_xmlid(xml_id)? else {
            return Ok(false);
        };
        Ok(self.principal(env)?.in_group(gid))
    }
}
