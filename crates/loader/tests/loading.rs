use serde_json::json;
use strata_base::authenticate;
use strata_core::XmlId;
use strata_infra::store::Database;
use strata_loader::{
    AddonCatalog, DataApplier, LoadError, LoadOptions, ModuleLoader, StaticAddon,
};
use strata_orm::{Domain, Env, Field, ModelDef, Operator};

fn item_model() -> ModelDef {
    ModelDef::new("item")
        .description("Item")
        .field(Field::char("name").required().translate())
        .field(Field::integer("qty").default(1))
}

/// Addon `name` whose data files are played in the given order.
fn addon(name: &str, depends: &[&str], files: &[(&str, &str)]) -> StaticAddon {
    let quoted = |items: Vec<&str>| {
        items
            .iter()
            .map(|i| format!("\"{i}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let data: Vec<&str> = files
        .iter()
        .map(|(path, _)| *path)
        .filter(|p| !p.starts_with("i18n/"))
        .collect();
    let manifest = format!(
        "name = \"{name}\"\ndepends = [{}]\ndata = [{}]\n",
        quoted(depends.to_vec()),
        quoted(data)
    );
    StaticAddon::from_manifest_str(&manifest).unwrap().with_files(files)
}

fn items_addon(xml: &str) -> StaticAddon {
    addon("m", &[], &[("data/items.xml", xml)]).with_models(|| vec![item_model()])
}

fn catalog_with(addons: Vec<StaticAddon>) -> AddonCatalog {
    let mut catalog = AddonCatalog::with_base().unwrap();
    for addon in addons {
        catalog.add(addon);
    }
    catalog
}

fn loader(db: &Database, addons: Vec<StaticAddon>) -> ModuleLoader {
    ModuleLoader::open(db.clone(), catalog_with(addons), LoadOptions::default()).unwrap()
}

fn names(env: &Env, model: &str) -> Vec<String> {
    env.model(model)
        .unwrap()
        .search(&Domain::True)
        .unwrap()
        .iter()
        .map(|r| r.get_text("name").unwrap().unwrap_or_default())
        .collect()
}

const ITEM_A: &str = r#"<strata>
    <record id="m.a" model="item">
        <field name="name">A</field>
    </record>
</strata>"#;

#[test]
fn base_install_creates_the_superuser_and_admin() {
    let db = Database::in_memory("base");
    let mut loader = loader(&db, Vec::new());
    let report = loader.install(&["base"]).unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.installed, vec!["base"]);

    let env = loader.env();
    let root = env.ref_record("base.user_root").unwrap();
    assert_eq!(root.ids(), &[1]);
    let admin = env.ref_id("base.user_admin").unwrap().1;
    assert_eq!(authenticate(&env, "admin", "admin").unwrap(), Some(admin));
    assert!(env.ref_id("base.access_res_users_user").is_ok());
    assert!(env.ref_id("base.model_res_users").is_ok());

    let state = env
        .model("ir.module.module")
        .unwrap()
        .search(&Domain::leaf("name", Operator::Eq, "base"))
        .unwrap()
        .get_text("state")
        .unwrap();
    assert_eq!(state.as_deref(), Some("installed"));
}

#[test]
fn loading_the_same_file_twice_keeps_one_row() {
    let db = Database::in_memory("idempotent");
    let mut loader = loader(&db, vec![items_addon(ITEM_A)]);
    assert!(loader.install(&["m"]).unwrap().is_success());

    let report = loader.upgrade(&["m"]).unwrap();
    assert_eq!(report.upgraded, vec!["m"]);

    let env = loader.env();
    assert_eq!(names(&env, "item"), vec!["A"]);
    let (model, id) = env.ref_id("m.a").unwrap();
    assert_eq!(model, "item");

    // The applier on its own is idempotent too.
    let mut applier = DataApplier::new(&env, "m");
    assert_eq!(applier.apply_file("data/items.xml", ITEM_A).unwrap(), 1);
    assert_eq!(applier.apply_file("data/items.xml", ITEM_A).unwrap(), 1);
    assert_eq!(applier.stats().created, 0);
    assert_eq!(applier.stats().updated, 2);
    assert_eq!(env.model("item").unwrap().search_count(&Domain::True).unwrap(), 1);
    assert_eq!(env.ref_id("m.a").unwrap().1, id);
}

#[test]
fn noupdate_records_are_never_overwritten() {
    let db = Database::in_memory("noupdate");
    let v1 = r#"<strata><data noupdate="1">
        <record id="a" model="item"><field name="name">A</field></record>
    </data></strata>"#;
    let v2 = v1.replace(">A<", ">B<");

    let mut first = loader(&db, vec![items_addon(v1)]);
    first.install(&["m"]).unwrap();

    let mut second = loader(&db, vec![items_addon(&v2)]);
    assert!(second.is_installed("m"));
    assert!(second.upgrade(&["m"]).unwrap().is_success());
    assert_eq!(names(&second.env(), "item"), vec!["A"]);
}

#[test]
fn updatable_records_follow_the_file() {
    let db = Database::in_memory("update");
    let mut first = loader(&db, vec![items_addon(ITEM_A)]);
    first.install(&["m"]).unwrap();

    let mut second = loader(&db, vec![items_addon(&ITEM_A.replace(">A<", ">A2<"))]);
    second.upgrade(&["all"]).unwrap();
    assert_eq!(names(&second.env(), "item"), vec!["A2"]);
}

#[test]
fn dependencies_install_first() {
    let db = Database::in_memory("deps");
    let a = addon("a", &[], &[]).with_models(|| vec![item_model()]);
    let b = addon(
        "b",
        &["a"],
        &[("data/b.xml", r#"<strata><record id="one" model="item"><field name="name">from b</field></record></strata>"#)],
    );
    let mut loader = loader(&db, vec![a, b]);
    let report = loader.install(&["b"]).unwrap();
    assert_eq!(report.installed, vec!["base", "a", "b"]);
    assert_eq!(loader.installed(), &["base", "a", "b"]);
    assert_eq!(names(&loader.env(), "item"), vec!["from b"]);

    let reopened = ModuleLoader::open(db.clone(), loader.catalog().clone(), LoadOptions::default()).unwrap();
    assert_eq!(reopened.installed(), &["base", "a", "b"]);
    assert!(reopened.registry().contains("item"));
}

#[test]
fn dependency_inversions_are_rejected() {
    let db = Database::in_memory("cycle");
    let mut loader = loader(&db, vec![addon("a", &["b"], &[]), addon("b", &["a"], &[])]);
    let err = loader.install(&["b"]).unwrap_err();
    assert!(matches!(err, LoadError::DependencyCycle(_)), "{err}");
    assert!(loader.installed().is_empty(), "nothing is loaded on a planning error");

    let mut loader = self::loader(&db, vec![addon("c", &["ghost"], &[])]);
    let err = loader.install(&["c"]).unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
}

#[test]
fn a_failing_module_is_rolled_back_and_blocks_its_dependents() {
    let db = Database::in_memory("failure");
    let bad = addon(
        "bad",
        &[],
        &[("data/bad.xml", r#"<strata><record id="x" model="item"><field name="nope">1</field></record></strata>"#)],
    )
    .with_models(|| vec![item_model()]);
    let after = addon("after", &["bad"], &[]);
    let mut loader = loader(&db, vec![bad, after]);

    let report = loader.install(&["after"]).unwrap();
    assert_eq!(report.installed, vec!["base"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].module, "bad");
    assert!(report.failed[0].error.contains("nope"), "{}", report.failed[0].error);
    assert_eq!(report.skipped, vec!["after"]);

    assert!(!loader.is_installed("bad"));
    assert!(!loader.registry().contains("item"));
    let env = loader.env();
    assert!(env.lookup_xmlid("bad.x").unwrap().is_none());
    assert!(env.ref_id("base.model_item").is_err());
}

#[test]
fn upgrades_remove_records_dropped_from_the_files() {
    let db = Database::in_memory("obsolete");
    let v1 = r#"<strata>
        <record id="a" model="item"><field name="name">A</field></record>
        <record id="b" model="item"><field name="name">B</field></record>
    </strata>"#;
    let mut first = loader(&db, vec![items_addon(v1)]);
    first.install(&["m"]).unwrap();
    assert_eq!(names(&first.env(), "item"), vec!["A", "B"]);

    let mut second = loader(&db, vec![items_addon(ITEM_A)]);
    second.upgrade(&["m"]).unwrap();
    let env = second.env();
    assert_eq!(names(&env, "item"), vec!["A"]);
    assert!(env.lookup_xmlid("m.b").unwrap().is_none());
}

#[test]
fn csv_files_load_rows_with_references() {
    let db = Database::in_memory("csv");
    let tagged = addon(
        "m",
        &[],
        &[(
            "data/item.csv",
            "id,name,qty\nitem_1,First,3\nitem_2,Second,\n",
        )],
    )
    .with_models(|| vec![item_model()]);
    let access = addon(
        "grants",
        &["m"],
        &[(
            "data/ir.model.access.csv",
            "id,name,model_id:id,group_id:id,perm_read\naccess_item,item user,base.model_item,base.group_user,1\n",
        )],
    );
    let mut loader = loader(&db, vec![tagged, access]);
    assert!(loader.install(&["grants"]).unwrap().is_success());

    let env = loader.env();
    let first = env.ref_record("m.item_1").unwrap();
    assert_eq!(first.get("qty").unwrap().as_int(), Some(3));
    let second = env.ref_record("m.item_2").unwrap();
    assert!(!second.get("qty").unwrap().is_truthy());

    let grant = env.ref_record("grants.access_item").unwrap();
    assert_eq!(grant.get("model_id").unwrap().as_id(), Some(env.ref_id("base.model_item").unwrap().1));
    assert_eq!(grant.get("group_id").unwrap().as_id(), Some(env.ref_id("base.group_user").unwrap().1));
    assert!(grant.get("perm_read").unwrap().is_truthy());
}

#[test]
fn eval_fields_resolve_refs() {
    let db = Database::in_memory("eval");
    let groups = addon(
        "m",
        &[],
        &[(
            "data/groups.xml",
            r#"<strata>
                <record id="group_manager" model="res.groups">
                    <field name="name">Manager</field>
                    <field name="implied_ids" eval="[(4, ref('base.group_user'))]"/>
                </record>
            </strata>"#,
        )],
    );
    let mut loader = loader(&db, vec![groups]);
    loader.install(&["m"]).unwrap();
    let env = loader.env();
    let manager = env.ref_record("m.group_manager").unwrap();
    assert_eq!(
        manager.get("implied_ids").unwrap().as_ids(),
        vec![env.ref_id("base.group_user").unwrap().1]
    );
}

#[test]
fn uninstall_removes_data_and_dependents() {
    let db = Database::in_memory("uninstall");
    let extra = addon(
        "extra",
        &["m"],
        &[("data/extra.xml", r#"<strata><record id="c" model="item"><field name="name">C</field></record></strata>"#)],
    );
    let mut loader = loader(&db, vec![items_addon(ITEM_A), extra]);
    loader.install(&["extra"]).unwrap();
    let id = loader.env().ref_id("m.a").unwrap().1;

    assert!(matches!(loader.uninstall(&["base"]), Err(LoadError::CannotUninstall(_))));

    let report = loader.uninstall(&["m"]).unwrap();
    assert_eq!(report.removed, vec!["extra", "m"]);
    assert_eq!(loader.installed(), &["base"]);
    assert!(!loader.registry().contains("item"));

    let env = loader.env();
    assert!(env.lookup_xmlid("m.a").unwrap().is_none());
    assert!(env.lookup_xmlid("base.model_item").unwrap().is_none());
    let states: Vec<String> = env
        .model("ir.module.module")
        .unwrap()
        .search(&Domain::leaf("name", Operator::In, json!(["m", "extra"])))
        .unwrap()
        .iter()
        .map(|r| r.get_text("state").unwrap().unwrap_or_default())
        .collect();
    assert_eq!(states, vec!["uninstalled", "uninstalled"]);
    // Tables stay, emptied of the module's records.
    assert!(env.with_cursor(|cr| cr.has_table("item")));
    assert!(!env.with_cursor(|cr| cr.exists("item", id).unwrap()));

    // Reinstalling loads the data again.
    assert!(loader.install(&["m"]).unwrap().is_success());
    assert_eq!(names(&loader.env(), "item"), vec!["A"]);
}

#[test]
fn languages_pull_in_module_translations() {
    let db = Database::in_memory("i18n");
    let translated = addon(
        "m",
        &[],
        &[
            ("data/items.xml", ITEM_A),
            ("i18n/fr_FR.csv", "id,field,value\na,name,Article A\nbase.group_user,name,Utilisateur interne\n"),
        ],
    )
    .with_models(|| vec![item_model()]);
    let mut loader = loader(&db, vec![translated]);
    loader.install(&["m"]).unwrap();

    assert_eq!(loader.load_language("fr_FR").unwrap(), 2);
    let env = loader.env();
    let item = env.ref_record("m.a").unwrap();
    assert_eq!(item.get_text("name").unwrap().as_deref(), Some("A"));
    let french = env.with_lang("fr_FR").browse("item", item.ids().to_vec()).unwrap();
    assert_eq!(french.get_text("name").unwrap().as_deref(), Some("Article A"));

    let lang = env
        .model("res.lang")
        .unwrap()
        .search(&Domain::leaf("code", Operator::Eq, "fr_FR"))
        .unwrap();
    assert_eq!(lang.len(), 1);
    assert!(lang.get("active").unwrap().is_truthy());
    assert!(env.lookup_xmlid("m.a").unwrap().is_some());
    assert_eq!(XmlId::qualify("a", "m").unwrap().to_string(), "m.a");
}

#[test]
fn demo_data_can_be_disabled() {
    let manifest = "name = \"m\"\ndata = [\"data/items.xml\"]\ndemo = [\"demo/more.xml\"]\n";
    let demo_addon = || {
        StaticAddon::from_manifest_str(manifest)
            .unwrap()
            .with_models(|| vec![item_model()])
            .with_files(&[
                ("data/items.xml", ITEM_A),
                ("demo/more.xml", r#"<strata><record id="demo" model="item"><field name="name">Demo</field></record></strata>"#),
            ])
    };

    let db = Database::in_memory("demo");
    let mut with_demo = loader(&db, vec![demo_addon()]);
    with_demo.install(&["m"]).unwrap();
    assert_eq!(names(&with_demo.env(), "item"), vec!["A", "Demo"]);

    let db = Database::in_memory("no-demo");
    let options = LoadOptions { without_demo: true };
    let mut without = ModuleLoader::open(db, catalog_with(vec![demo_addon()]), options).unwrap();
    without.install(&["m"]).unwrap();
    assert_eq!(names(&without.env(), "item"), vec!["A"]);
}

#[test]
fn reload_covers_reverse_dependencies() {
    let db = Database::in_memory("reload");
    let mut loader = loader(&db, vec![items_addon(ITEM_A)]);
    assert!(loader.install(&["m"]).unwrap().is_success());

    let affected = loader.reload("base").unwrap();
    assert!(affected.contains("base") && affected.contains("m"));
    assert_eq!(names(&loader.env(), "item"), vec!["A"]);
    assert!(matches!(loader.reload("ghost"), Err(LoadError::NotInstalled(_))));
}
