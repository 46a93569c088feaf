use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use strata_auth::AccessMode;
use strata_base::{BaseAccessPolicy, access_policy, authenticate, model_defs, reflect_models};
use strata_core::{OrmError, RecordId};
use strata_infra::store::Database;
use strata_orm::{Domain, Env, Field, ModelDef, Operator, Registry, SearchParams};

struct Fixture {
    env: Env,
    group: RecordId,
    user: RecordId,
}

fn doc_model() -> ModelDef {
    ModelDef::new("doc")
        .in_module("test")
        .field(Field::char("name"))
        .field(Field::integer("x"))
        .field(Field::char("secret").groups(&["test.group_manager"]))
}

fn fixture() -> Fixture {
    let mut defs = model_defs();
    defs.push(doc_model());
    let registry = Arc::new(Registry::build(defs, access_policy()).unwrap());
    let db = Database::in_memory("base-tests");
    let mut cr = db.cursor();
    registry.reconcile_schema(&mut cr).unwrap();
    let env = Env::superuser(registry, cr);
    reflect_models(&env).unwrap();

    let users = env.model("res.users").unwrap();
    let root = users
        .create_one(json!({"name": "System", "login": "__system__", "active": false}))
        .unwrap();
    assert_eq!(root.ids(), &[1]);

    let group = env
        .model("res.groups")
        .unwrap()
        .create_one(json!({"name": "G"}))
        .unwrap()
        .id()
        .unwrap();
    let user = users
        .create_one(json!({
            "name": "U",
            "login": "u",
            "password": "secret",
            "groups_id": [[6, 0, [group]]],
        }))
        .unwrap()
        .id()
        .unwrap();
    Fixture { env, group, user }
}

fn doc_model_id(env: &Env) -> RecordId {
    env.ref_id("base.model_doc").unwrap().1
}

fn grant(fx: &Fixture, read: bool, write: bool) {
    fx.env
        .model("ir.model.access")
        .unwrap()
        .create_one(json!({
            "name": "doc G",
            "model_id": doc_model_id(&fx.env),
            "group_id": fx.group,
            "perm_read": read,
            "perm_write": write,
        }))
        .unwrap();
}

fn add_rule(env: &Env, group: Option<RecordId>, domain: &str) {
    let groups: Vec<RecordId> = group.into_iter().collect();
    env.model("ir.rule")
        .unwrap()
        .create_one(json!({
            "name": format!("rule {domain}"),
            "model_id": doc_model_id(env),
            "groups": [[6, 0, groups]],
            "domain_force": domain,
        }))
        .unwrap();
}

#[test]
fn read_only_grant_allows_read_and_denies_write() {
    let fx = fixture();
    grant(&fx, true, false);
    let doc = fx.env.model("doc").unwrap().create_one(json!({"x": 0})).unwrap();

    let as_user = doc.with_user(fx.user);
    let err = as_user.write_json(json!({"x": 1})).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");

    let rows = as_user.read(&["x"]).unwrap();
    assert_eq!(rows[0]["x"], json!(0));
}

#[test]
fn no_grant_means_no_access() {
    let fx = fixture();
    let docs = fx.env.model("doc").unwrap().with_user(fx.user);
    let err = docs.search(&Domain::True).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");
    let err = docs
        .browse([1, 2])
        .call("exists", &[], &serde_json::Map::new())
        .unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");

    let explanation = BaseAccessPolicy::new()
        .explain(docs.env(), "doc", AccessMode::Read)
        .unwrap();
    assert!(!explanation.granted);
}

#[test]
fn implied_groups_carry_grants() {
    let fx = fixture();
    grant(&fx, true, true);
    let manager = fx
        .env
        .model("res.groups")
        .unwrap()
        .create_one(json!({"name": "Manager", "implied_ids": [[4, fx.group]]}))
        .unwrap()
        .id()
        .unwrap();
    let boss = fx
        .env
        .model("res.users")
        .unwrap()
        .create_one(json!({"name": "Boss", "login": "boss", "groups_id": [[4, manager]]}))
        .unwrap()
        .id()
        .unwrap();
    let docs = fx.env.model("doc").unwrap().with_user(boss);
    assert!(docs.create_one(json!({"x": 3})).is_err(), "no create right");
    let doc = fx.env.model("doc").unwrap().create_one(json!({"x": 3})).unwrap();
    doc.with_user(boss).write_json(json!({"x": 4})).unwrap();
    assert_eq!(doc.get("x").unwrap().as_int(), Some(4));
}

#[test]
fn record_rules_filter_search_and_guard_writes() {
    let fx = fixture();
    grant(&fx, true, true);
    let docs = fx.env.model("doc").unwrap();
    let low = docs.create_one(json!({"x": 1})).unwrap();
    let high = docs.create_one(json!({"x": 5})).unwrap();
    add_rule(&fx.env, Some(fx.group), "[('x', '>=', 3)]");

    let as_user = docs.with_user(fx.user);
    assert_eq!(as_user.search(&Domain::True).unwrap().ids(), high.ids());

    let err = low.with_user(fx.user).read(&["x"]).unwrap_err();
    assert!(matches!(err, OrmError::Missing(_)), "{err:?}");
    let err = low.with_user(fx.user).write_json(json!({"name": "n"})).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");
    high.with_user(fx.user).write_json(json!({"name": "n"})).unwrap();

    // The superuser ignores rules.
    assert_eq!(docs.search_count(&Domain::True).unwrap(), 2);
}

#[test]
fn rules_see_the_current_user() {
    let fx = fixture();
    grant(&fx, true, true);
    let docs = fx.env.model("doc").unwrap();
    docs.create_one(json!({"x": fx.user})).unwrap();
    docs.create_one(json!({"x": 99})).unwrap();
    add_rule(&fx.env, None, "[('x', '=', user.id)]");
    let visible = docs.with_user(fx.user).search(&Domain::True).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible.get("x").unwrap().as_int(), Some(fx.user));
}

#[test]
fn restricted_fields_are_hidden_from_other_groups() {
    let fx = fixture();
    grant(&fx, true, true);
    let doc = fx
        .env
        .model("doc")
        .unwrap()
        .create_one(json!({"x": 1, "secret": "s"}))
        .unwrap();
    let as_user = doc.with_user(fx.user);
    let rows = as_user.read(&[]).unwrap();
    assert!(rows[0].contains_key("x"));
    assert!(!rows[0].contains_key("secret"));
    let err = as_user.write_json(json!({"secret": "t"})).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");
}

#[test]
fn restricted_fields_cannot_be_searched_or_grouped() {
    let fx = fixture();
    grant(&fx, true, false);
    let docs = fx.env.model("doc").unwrap();
    docs.create_one(json!({"x": 1, "secret": "alpha"})).unwrap();
    docs.create_one(json!({"x": 2, "secret": "beta"})).unwrap();
    let as_user = docs.with_user(fx.user);
    let all = SearchParams::default();

    let by_secret = Domain::leaf("secret", Operator::Eq, "alpha");
    let err = as_user.search(&by_secret).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");
    let err = as_user.read_group(&Domain::True, &["x"], &["secret"], &all).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");
    let err = as_user.read_group(&Domain::True, &["secret:count"], &["x"], &all).unwrap_err();
    assert!(matches!(err, OrmError::Access(_)), "{err:?}");

    let groups = as_user.read_group(&Domain::True, &["x"], &["name"], &all).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["x"], json!(3));
    assert_eq!(docs.search(&by_secret).unwrap().len(), 1);
}

#[test]
fn passwords_are_hashed_and_checked() {
    let fx = fixture();
    assert_eq!(authenticate(&fx.env, "u", "secret").unwrap(), Some(fx.user));
    assert_eq!(authenticate(&fx.env, "u", "wrong").unwrap(), None);
    assert_eq!(authenticate(&fx.env, "__system__", "").unwrap(), None);

    let user = fx.env.browse("res.users", [fx.user]).unwrap();
    let hash = user.get_text("password_hash").unwrap().unwrap_or_default();
    assert!(hash.starts_with("sha256$"));
    assert_eq!(user.get_text("password").unwrap().as_deref(), Some(""));

    strata_base::set_password(&fx.env, fx.user, "changed").unwrap();
    assert_eq!(authenticate(&fx.env, "u", "changed").unwrap(), Some(fx.user));
}

#[test]
fn global_flag_follows_rule_groups() {
    let fx = fixture();
    add_rule(&fx.env, None, "[]");
    add_rule(&fx.env, Some(fx.group), "[]");
    let rules = fx.env.model("ir.rule").unwrap().search(&Domain::True).unwrap();
    let flags: Vec<bool> = rules
        .sorted(Some("id"), false)
        .unwrap()
        .iter()
        .map(|r| r.get("global").unwrap().is_truthy())
        .collect();
    assert_eq!(flags, vec![true, false]);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        ..ProptestConfig::default()
    })]

    /// Adding a rule never makes more records visible.
    #[test]
    fn adding_a_rule_only_shrinks_visibility(
        xs in prop::collection::vec(0i64..10, 1..8),
        first in 0i64..10,
        second in 0i64..10,
        second_is_global in any::<bool>(),
    ) {
        let fx = fixture();
        grant(&fx, true, false);
        let docs = fx.env.model("doc").unwrap();
        for x in &xs {
            docs.create_one(json!({"x": x})).unwrap();
        }
        let as_user = docs.with_user(fx.user);

        add_rule(&fx.env, Some(fx.group), &format!("[('x', '>=', {first})]"));
        let before = as_user.search(&Domain::True).unwrap();

        let group = if second_is_global { None } else { Some(fx.group) };
        add_rule(&fx.env, group, &format!("[('x', '<=', {second})]"));
        let after = as_user.search(&Domain::True).unwrap();

        prop_assert!(after.ids().iter().all(|id| before.contains(*id)));
        let expected = xs.iter().filter(|x| **x >= first && **x <= second).count();
        prop_assert_eq!(after.len(), expected);
    }
}
