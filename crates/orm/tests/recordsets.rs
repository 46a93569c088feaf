use std::sync::Arc;

use serde_json::{Map, Value as JsonValue, json};
use strata_core::{OrmError, Value};
use strata_infra::store::Database;
use strata_orm::{
    Command, Domain, Env, Field, ModelDef, OnDelete, Operator, RecordSet, Registry, SearchParams,
};

fn env_with(defs: Vec<ModelDef>) -> Env {
    let registry = Arc::new(Registry::unrestricted(defs).unwrap());
    let db = Database::in_memory("orm-tests");
    let mut cr = db.cursor();
    registry.reconcile_schema(&mut cr).unwrap();
    Env::superuser(registry, cr)
}

fn obj(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn item_models() -> Vec<ModelDef> {
    vec![
        ModelDef::new("item")
            .in_module("test")
            .field(Field::char("name").required())
            .field(Field::integer("qty").default(1))
            .field(Field::boolean("active").default(true))
            .unique("name_uniq", &["name"], "Item names must be unique"),
    ]
}

fn order_models() -> Vec<ModelDef> {
    vec![
        ModelDef::new("sale.order")
            .in_module("test")
            .field(Field::char("name"))
            .field(Field::one2many("line_ids", "sale.order.line", "order_id"))
            .field(
                Field::float("total")
                    .compute(&["line_ids.subtotal"], |order| {
                        let mut total = 0.0;
                        for line in order.get_record("line_ids")?.iter() {
                            total += line.get("subtotal")?.as_float().unwrap_or(0.0);
                        }
                        Ok(Value::Float(total))
                    })
                    .store(true),
            ),
        ModelDef::new("sale.order.line")
            .in_module("test")
            .field(
                Field::many2one("order_id", "sale.order")
                    .on_delete(OnDelete::Cascade)
                    .required(),
            )
            .field(Field::float("subtotal")),
    ]
}

fn qty_of(record: &RecordSet) -> i64 {
    record.get("qty").unwrap().as_int().unwrap()
}

#[test]
fn create_applies_defaults_and_search_filters() {
    let env = env_with(item_models());
    let items = env.model("item").unwrap();
    let created = items
        .create(vec![obj(json!({"name": "A"})), obj(json!({"name": "B", "qty": 3}))])
        .unwrap();
    assert_eq!(created.len(), 2);
    let qtys: Vec<i64> = created.iter().map(|r| qty_of(&r)).collect();
    assert_eq!(qtys, vec![1, 3]);

    let found = items.search(&Domain::leaf("qty", Operator::Ge, 2)).unwrap();
    assert_eq!(found.ids(), &created.ids()[1..]);
}

#[test]
fn search_without_domain_returns_every_record_in_id_order() {
    let env = env_with(item_models());
    let items = env.model("item").unwrap();
    let created = items
        .create(vec![obj(json!({"name": "c"})), obj(json!({"name": "a"})), obj(json!({"name": "b"}))])
        .unwrap();
    let all = items.search_with(&Domain::True, &SearchParams::order("id")).unwrap();
    assert_eq!(all, created);

    let by_name = items.search_with(&Domain::True, &SearchParams::order("name desc")).unwrap();
    let names: Vec<String> = by_name.iter().map(|r| r.get_text("name").unwrap().unwrap()).collect();
    assert_eq!(names, vec!["c", "b", "a"]);

    let window = SearchParams {
        offset: 1,
        limit: Some(1),
        order: Some("name".into()),
    };
    let page = items.search_with(&Domain::True, &window).unwrap();
    assert_eq!(page.get_text("name").unwrap().as_deref(), Some("b"));
}

#[test]
fn missing_required_field_is_a_validation_error() {
    let env = env_with(item_models());
    let err = env.model("item").unwrap().create(vec![obj(json!({"qty": 2}))]).unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)), "{err:?}");
    assert_eq!(env.model("item").unwrap().search_count(&Domain::True).unwrap(), 0);
}

#[test]
fn unique_constraint_reports_its_message() {
    let env = env_with(item_models());
    let items = env.model("item").unwrap();
    items.create_one(json!({"name": "A"})).unwrap();
    let err = items.create_one(json!({"name": "A"})).unwrap_err();
    assert_eq!(err, OrmError::Integrity("Item names must be unique".into()));
}

#[test]
fn archived_records_are_hidden_unless_asked_for() {
    let env = env_with(item_models());
    let items = env.model("item").unwrap();
    let a = items.create_one(json!({"name": "A"})).unwrap();
    items.create_one(json!({"name": "B"})).unwrap();
    a.action_archive().unwrap();

    assert_eq!(items.search_count(&Domain::True).unwrap(), 1);
    let with_archived = items.with_context_value("active_test", false);
    assert_eq!(with_archived.search_count(&Domain::True).unwrap(), 2);
    let archived = items.search(&Domain::leaf("active", Operator::Eq, false)).unwrap();
    assert_eq!(archived, a);

    a.action_unarchive().unwrap();
    assert_eq!(items.search_count(&Domain::True).unwrap(), 2);
}

#[test]
fn stored_total_follows_its_lines() {
    let env = env_with(order_models());
    let order = env
        .model("sale.order")
        .unwrap()
        .create_one(json!({
            "name": "SO1",
            "line_ids": [[0, 0, {"subtotal": 10.0}], [0, 0, {"subtotal": 5.5}]]
        }))
        .unwrap();
    assert_eq!(order.get("total").unwrap(), Value::Float(15.5));

    let lines = order.get_record("line_ids").unwrap();
    assert_eq!(lines.len(), 2);
    lines.browse([lines.ids()[0]]).set("subtotal", 7.0).unwrap();
    assert_eq!(order.get("total").unwrap(), Value::Float(12.5));

    lines.browse([lines.ids()[1]]).unlink().unwrap();
    assert_eq!(order.get("total").unwrap(), Value::Float(7.0));
}

#[test]
fn deleting_an_order_cascades_to_its_lines() {
    let env = env_with(order_models());
    let order = env
        .model("sale.order")
        .unwrap()
        .create_one(json!({"line_ids": [[0, 0, {"subtotal": 1.0}]]}))
        .unwrap();
    order.unlink().unwrap();
    assert!(order.exists().unwrap().is_empty());
    assert_eq!(env.model("sale.order.line").unwrap().search_count(&Domain::True).unwrap(), 0);
}

#[test]
fn one2many_commands_link_and_detach() {
    let env = env_with(order_models());
    let orders = env.model("sale.order").unwrap();
    let first = orders.create_one(json!({"name": "first"})).unwrap();
    let second = orders
        .create_one(json!({"name": "second", "line_ids": [[0, 0, {"subtotal": 4.0}]]}))
        .unwrap();
    let line = second.get_record("line_ids").unwrap();

    first
        .write_json(json!({"line_ids": [Command::Link(line.ids()[0]).to_json()]}))
        .unwrap();
    assert_eq!(first.get("total").unwrap(), Value::Float(4.0));
    assert_eq!(second.get("total").unwrap(), Value::Float(0.0));

    // The inverse is required: removing the line deletes it.
    first.write_json(json!({"line_ids": [[5]]})).unwrap();
    assert!(line.exists().unwrap().is_empty());
    assert_eq!(first.get("total").unwrap(), Value::Float(0.0));
}

#[test]
fn restrict_blocks_unlink() {
    let env = env_with(vec![
        ModelDef::new("res.partner").in_module("test").field(Field::char("name")),
        ModelDef::new("invoice")
            .in_module("test")
            .field(Field::many2one("partner_id", "res.partner").on_delete(OnDelete::Restrict)),
    ]);
    let partner = env.model("res.partner").unwrap().create_one(json!({"name": "P"})).unwrap();
    env.model("invoice")
        .unwrap()
        .create_one(json!({"partner_id": partner.ids()[0]}))
        .unwrap();
    let err = partner.unlink().unwrap_err();
    assert!(matches!(err, OrmError::Integrity(_)), "{err:?}");
    assert_eq!(partner.exists().unwrap(), partner);
}

#[test]
fn set_null_clears_references() {
    let env = env_with(vec![
        ModelDef::new("res.partner").in_module("test").field(Field::char("name")),
        ModelDef::new("invoice")
            .in_module("test")
            .field(Field::many2one("partner_id", "res.partner")),
    ]);
    let partner = env.model("res.partner").unwrap().create_one(json!({"name": "P"})).unwrap();
    let invoice = env
        .model("invoice")
        .unwrap()
        .create_one(json!({"partner_id": partner.ids()[0]}))
        .unwrap();
    assert_eq!(invoice.get("partner_id").unwrap(), Value::Id(partner.ids()[0]));
    partner.unlink().unwrap();
    assert_eq!(invoice.get("partner_id").unwrap(), Value::Null);
}

#[test]
fn many2many_links_are_idempotent_and_follow_target_order() {
    let env = env_with(vec![
        ModelDef::new("test.tag").in_module("test").field(Field::char("name")),
        ModelDef::new("test.item")
            .in_module("test")
            .field(Field::char("name"))
            .field(Field::many2many("tag_ids", "test.tag")),
    ]);
    let tags = env
        .model("test.tag")
        .unwrap()
        .create(vec![obj(json!({"name": "t1"})), obj(json!({"name": "t2"}))])
        .unwrap();
    let (t1, t2) = (tags.ids()[0], tags.ids()[1]);
    let item = env.model("test.item").unwrap().create_one(json!({"name": "x"})).unwrap();

    item.write_json(json!({"tag_ids": [[4, t1], [4, t1]]})).unwrap();
    assert_eq!(item.get("tag_ids").unwrap(), Value::Ids(vec![t1]));

    item.write_json(json!({"tag_ids": [[6, 0, [t2, t1]]]})).unwrap();
    assert_eq!(item.get("tag_ids").unwrap(), Value::Ids(vec![t1, t2]));

    item.write_json(json!({"tag_ids": [[3, t1]]})).unwrap();
    assert_eq!(item.get("tag_ids").unwrap(), Value::Ids(vec![t2]));

    tags.browse([t2]).unlink().unwrap();
    assert_eq!(item.get("tag_ids").unwrap(), Value::Ids(vec![]));

    let tagged = env
        .model("test.item")
        .unwrap()
        .search(&Domain::leaf("tag_ids.name", Operator::Eq, "t1"))
        .unwrap();
    assert!(tagged.is_empty());
}

#[test]
fn empty_recordsets_are_no_ops() {
    let env = env_with(item_models());
    let empty = env.model("item").unwrap();
    empty.write(&obj(json!({"name": "never"}))).unwrap();
    empty.unlink().unwrap();
    assert_eq!(empty.filtered(|_| Ok(true)).unwrap(), empty);
    assert!(empty.read(&[]).unwrap().is_empty());
}

#[test]
fn failed_check_constraint_rolls_the_create_back() {
    let env = env_with(vec![
        ModelDef::new("item")
            .in_module("test")
            .field(Field::char("name"))
            .field(Field::integer("qty"))
            .constraint("positive_qty", &["qty"], |records| {
                for r in records.iter() {
                    if r.get("qty")?.as_int().unwrap_or(0) < 0 {
                        return Err(OrmError::validation("quantity must be positive"));
                    }
                }
                Ok(())
            }),
    ]);
    let items = env.model("item").unwrap();
    assert!(items.create_one(json!({"name": "bad", "qty": -1})).is_err());
    assert_eq!(items.search_count(&Domain::True).unwrap(), 0);

    let ok = items.create_one(json!({"name": "ok", "qty": 1})).unwrap();
    assert!(ok.set("qty", -5).is_err());
    assert_eq!(qty_of(&ok), 1);
}

#[test]
fn translations_are_kept_per_language() {
    let env = env_with(vec![
        ModelDef::new("product")
            .in_module("test")
            .field(Field::char("name").translate()),
    ]);
    let product = env.model("product").unwrap().create_one(json!({"name": "Chair"})).unwrap();
    product
        .with_context_value("lang", "fr_FR")
        .set("name", "Chaise")
        .unwrap();
    assert_eq!(product.get_text("name").unwrap().as_deref(), Some("Chair"));
    let french = product.with_context_value("lang", "fr_FR");
    assert_eq!(french.get_text("name").unwrap().as_deref(), Some("Chaise"));
    let found = french
        .search(&Domain::leaf("name", Operator::ILike, "chaise"))
        .unwrap();
    assert_eq!(found.ids(), product.ids());
}

#[test]
fn delegated_fields_live_on_the_parent() {
    let env = env_with(vec![
        ModelDef::new("res.partner").in_module("test").field(Field::char("name")),
        ModelDef::new("res.member")
            .in_module("test")
            .inherits("res.partner", "partner_id")
            .field(Field::char("code")),
    ]);
    let member = env
        .model("res.member")
        .unwrap()
        .create_one(json!({"name": "Ada", "code": "M1"}))
        .unwrap();
    let partner = member.get_record("partner_id").unwrap();
    assert_eq!(partner.len(), 1);
    assert_eq!(partner.get_text("name").unwrap().as_deref(), Some("Ada"));
    assert_eq!(member.get_text("name").unwrap().as_deref(), Some("Ada"));

    member.set("name", "Grace").unwrap();
    assert_eq!(partner.get_text("name").unwrap().as_deref(), Some("Grace"));

    let found = env
        .model("res.member")
        .unwrap()
        .search(&Domain::leaf("name", Operator::Eq, "Grace"))
        .unwrap();
    assert_eq!(found, member);
}

#[test]
fn overrides_call_the_previous_implementation() {
    let base = ModelDef::new("item")
        .in_module("a")
        .field(Field::char("name"))
        .method("describe", |records, _, _, _| {
            Ok(json!(format!("item {}", records.ids().len())))
        });
    let ext = ModelDef::extend("item")
        .in_module("b")
        .method("describe", |records, args, kwargs, sup| {
            let inner = sup.call(records, args, kwargs)?;
            Ok(json!(format!("[{}]", inner.as_str().unwrap_or_default())))
        })
        .model_method("create", |records, args, kwargs, sup| {
            let id = sup.call(records, args, kwargs)?;
            let created = records.browse([id.as_i64().unwrap_or_default()]);
            created.set("name", "overridden")?;
            Ok(id)
        });
    let env = env_with(vec![base, ext]);
    let items = env.model("item").unwrap();

    let id = items.call("create", &[json!({"name": "x"})], &Map::new()).unwrap();
    let created = items.browse([id.as_i64().unwrap()]);
    assert_eq!(created.get_text("name").unwrap().as_deref(), Some("overridden"));
    assert_eq!(created.call("describe", &[], &Map::new()).unwrap(), json!("[item 1]"));

    let err = items.call("nope", &[], &Map::new()).unwrap_err();
    assert!(matches!(err, OrmError::Missing(_)));
    assert!(!items.is_public_method("_private"));
    assert!(items.is_public_method("search_read"));
}

#[test]
fn read_group_counts_and_sums() {
    let env = env_with(vec![
        ModelDef::new("sale")
            .in_module("test")
            .field(Field::selection("state", &[("draft", "Draft"), ("done", "Done")]))
            .field(Field::float("amount")),
    ]);
    env.model("sale")
        .unwrap()
        .create(vec![
            obj(json!({"state": "draft", "amount": 1.5})),
            obj(json!({"state": "done", "amount": 2.0})),
            obj(json!({"state": "draft", "amount": 3.0})),
        ])
        .unwrap();
    let groups = env
        .model("sale")
        .unwrap()
        .read_group(&Domain::True, &["amount:sum"], &["state"], &SearchParams::default())
        .unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["state"], json!("done"));
    assert_eq!(groups[0]["__count"], json!(1));
    assert_eq!(groups[1]["state"], json!("draft"));
    assert_eq!(groups[1]["__count"], json!(2));
    assert_eq!(groups[1]["amount"], json!(4.5));
}

#[test]
fn copy_duplicates_stored_values() {
    let env = env_with(item_models());
    let original = env
        .model("item")
        .unwrap()
        .create_one(json!({"name": "A", "qty": 7}))
        .unwrap();
    let copy = original.copy(&obj(json!({"name": "A (copy)"}))).unwrap();
    assert_ne!(copy, original);
    assert_eq!(qty_of(&copy), 7);
    assert_eq!(copy.get_text("name").unwrap().as_deref(), Some("A (copy)"));
}

#[test]
fn name_search_and_read_render_references() {
    let env = env_with(vec![
        ModelDef::new("res.partner").in_module("test").field(Field::char("name")),
        ModelDef::new("invoice")
            .in_module("test")
            .field(Field::char("name"))
            .field(Field::many2one("partner_id", "res.partner")),
    ]);
    let partners = env
        .model("res.partner")
        .unwrap()
        .create(vec![obj(json!({"name": "Alpha"})), obj(json!({"name": "Beta"}))])
        .unwrap();
    let found = partners.name_search("alp", &Domain::True, Operator::ILike, None).unwrap();
    assert_eq!(found, vec![(partners.ids()[0], "Alpha".to_string())]);

    let invoice = env
        .model("invoice")
        .unwrap()
        .create_one(json!({"name": "INV1", "partner_id": partners.ids()[1]}))
        .unwrap();
    let rows = invoice.read(&["partner_id"]).unwrap();
    assert_eq!(rows[0]["partner_id"], json!([partners.ids()[1], "Beta"]));

    let by_partner = env
        .model("invoice")
        .unwrap()
        .search(&Domain::leaf("partner_id", Operator::ILike, "bet"))
        .unwrap();
    assert_eq!(by_partner, invoice);
}

#[test]
fn stored_related_fields_follow_their_source() {
    let mut defs = order_models();
    defs.push(
        ModelDef::extend("sale.order.line")
            .in_module("test")
            .field(Field::char("order_name").related("order_id.name").store(true)),
    );
    let env = env_with(defs);
    let order = env
        .model("sale.order")
        .unwrap()
        .create_one(json!({"name": "SO1", "line_ids": [[0, 0, {"subtotal": 1.0}]]}))
        .unwrap();
    let line = order.get_record("line_ids").unwrap();
    assert_eq!(line.get_text("order_name").unwrap().as_deref(), Some("SO1"));

    order.set("name", "SO2").unwrap();
    assert_eq!(line.get_text("order_name").unwrap().as_deref(), Some("SO2"));
    let found = env
        .model("sale.order.line")
        .unwrap()
        .search(&Domain::leaf("order_name", Operator::Eq, "SO2"))
        .unwrap();
    assert_eq!(found, line);
}

#[test]
fn dotted_paths_search_through_many2one() {
    let env = env_with(order_models());
    let orders = env.model("sale.order").unwrap();
    orders
        .create_one(json!({"name": "SO1", "line_ids": [[0, 0, {"subtotal": 1.0}], [0, 0, {"subtotal": 2.0}]]}))
        .unwrap();
    let other = orders
        .create_one(json!({"name": "SO2", "line_ids": [[0, 0, {"subtotal": 5.0}]]}))
        .unwrap();
    let lines = env.model("sale.order.line").unwrap();
    assert_eq!(lines.search_count(&Domain::leaf("order_id.name", Operator::Eq, "SO1")).unwrap(), 2);
    let found = lines.search(&Domain::leaf("order_id.name", Operator::Eq, "SO2")).unwrap();
    assert_eq!(found, other.get_record("line_ids").unwrap());
}

#[test]
fn child_of_and_parent_of_walk_the_hierarchy() {
    let env = env_with(vec![
        ModelDef::new("category")
            .in_module("test")
            .parent_name("parent_id")
            .field(Field::char("name"))
            .field(Field::many2one("parent_id", "category")),
    ]);
    let categories = env.model("category").unwrap();
    let root = categories.create_one(json!({"name": "root"})).unwrap();
    let mid = categories.create_one(json!({"name": "mid", "parent_id": root.ids()[0]})).unwrap();
    let leaf = categories.create_one(json!({"name": "leaf", "parent_id": mid.ids()[0]})).unwrap();
    let other = categories.create_one(json!({"name": "other"})).unwrap();

    let below = categories
        .search_with(&Domain::leaf("id", Operator::ChildOf, mid.ids()[0]), &SearchParams::order("id"))
        .unwrap();
    assert_eq!(below.ids(), &[mid.ids()[0], leaf.ids()[0]]);

    let above = categories
        .search_with(&Domain::leaf("id", Operator::ParentOf, leaf.ids()[0]), &SearchParams::order("id"))
        .unwrap();
    assert_eq!(above.ids(), &[root.ids()[0], mid.ids()[0], leaf.ids()[0]]);
    assert!(!above.ids().contains(&other.ids()[0]));
}

#[test]
fn computed_fields_write_and_search_through_their_hooks() {
    let env = env_with(vec![
        ModelDef::new("person")
            .in_module("test")
            .field(Field::char("first"))
            .field(
                Field::char("upper")
                    .compute(&["first"], |rec| {
                        let first = rec.get_text("first")?.unwrap_or_default();
                        Ok(Value::Text(first.to_uppercase()))
                    })
                    .inverse(|rec, value| rec.set("first", value.as_str().unwrap_or_default().to_lowercase()))
                    .search_with(|_, op, value| {
                        let first = value.as_str().unwrap_or_default().to_lowercase();
                        Ok(Domain::leaf("first", op, first))
                    }),
            ),
    ]);
    let people = env.model("person").unwrap();
    let ann = people.create_one(json!({"upper": "ANN"})).unwrap();
    people.create_one(json!({"first": "bob"})).unwrap();
    assert_eq!(ann.get_text("first").unwrap().as_deref(), Some("ann"));
    assert_eq!(ann.get_text("upper").unwrap().as_deref(), Some("ANN"));

    ann.set("upper", "ANNA").unwrap();
    assert_eq!(ann.get_text("first").unwrap().as_deref(), Some("anna"));

    let found = people.search(&Domain::leaf("upper", Operator::Eq, "BOB")).unwrap();
    assert_eq!(found.get_text("first").unwrap().as_deref(), Some("bob"));
}

#[test]
fn with_company_moves_the_company_first() {
    let env = env_with(vec![
        ModelDef::new("note")
            .in_module("test")
            .field(Field::integer("company").default_fn(|env| Ok(json!(env.company_id())))),
    ]);
    let env = env.with_context_value("allowed_company_ids", json!([1, 2, 3]));
    assert_eq!(env.company_id(), Some(1));

    let switched = env.with_company(3);
    assert_eq!(switched.company_id(), Some(3));
    assert_eq!(switched.context().company_ids(), vec![3, 1, 2]);

    let note = switched.model("note").unwrap().create_one(json!({})).unwrap();
    assert_eq!(note.get("company").unwrap().as_int(), Some(3));
}

#[test]
fn sorting_by_model_order_keeps_duplicates() {
    let env = env_with(item_models());
    let items = env.model("item").unwrap();
    let a = items.create_one(json!({"name": "a"})).unwrap().ids()[0];
    let b = items.create_one(json!({"name": "b"})).unwrap().ids()[0];

    let sorted = items.browse([b, a, b]).sorted(None, false).unwrap();
    assert_eq!(sorted.ids(), &[a, b, b]);
    let reversed = items.browse([b, a, b]).sorted(None, true).unwrap();
    assert_eq!(reversed.ids(), &[b, b, a]);
}
