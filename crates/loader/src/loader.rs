//! Install, upgrade and uninstall orchestration.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use strata_base::model_data::{self, XmlIdEntry};
use strata_base::models::{LANG, MODEL, MODULES};
use strata_base::{ModuleState, reflect_models};
use strata_core::value::DEFAULT_LANG;
use strata_core::{OrmError, XmlId};
use strata_infra::store::Database;
use strata_orm::{AccessPolicy, AllowAll, Domain, Env, Operator, RecordSet, Registry};
use tracing::{debug, error, info, instrument, warn};

use crate::addon::{Addon, AddonCatalog};
use crate::apply::{ApplyStats, DataApplier};
use crate::data::parse_translations;
use crate::error::LoadError;
use crate::graph;
use crate::report::LoadReport;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip the `demo` files of manifests.
    pub without_demo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Install,
    Upgrade,
}

/// Keeps a database and its registry in line with the installed modules.
pub struct ModuleLoader {
    db: Database,
    catalog: AddonCatalog,
    options: LoadOptions,
    registry: Arc<Registry>,
    /// Installed modules in load order.
    installed: Vec<String>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("db", &self.db.name())
            .field("installed", &self.installed)
            .finish()
    }
}

fn module_table() -> String {
    MODULES.replace('.', "_")
}

impl ModuleLoader {
    /// Load the registry of the modules installed in `db`.
    ///
    /// A database without the module table has nothing installed yet.
    #[instrument(skip_all, fields(db = %db.name()))]
    pub fn open(db: Database, catalog: AddonCatalog, options: LoadOptions) -> Result<Self, LoadError> {
        let mut loader = Self {
            db,
            catalog,
            options,
            registry: Arc::new(Registry::unrestricted(Vec::new())?),
            installed: Vec::new(),
        };
        let cursor = loader.db.cursor();
        if !cursor.has_table(&module_table()) {
            debug!("fresh database");
            return Ok(loader);
        }

        let env = Env::superuser(Arc::new(Registry::unrestricted(strata_base::model_defs())?), cursor);
        let mut installed = BTreeSet::new();
        for row in env.model(MODULES)?.search(&Domain::True)?.iter() {
            let state: ModuleState = row.get_text("state")?.unwrap_or_default().parse()?;
            if state.is_installed() {
                installed.insert(row.get_text("name")?.unwrap_or_default());
            }
        }
        drop(env);

        let mut graph = std::collections::BTreeMap::new();
        for module in &installed {
            let addon = loader.catalog.require(module)?;
            let deps = addon.manifest().dependencies();
            graph.insert(module.clone(), deps);
        }
        let order = graph::topological_order(&graph)?;
        loader.registry = Arc::new(loader.build_registry(&order)?);
        info!(modules = order.len(), "installed modules loaded");
        loader.installed = order;
        Ok(loader)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn catalog(&self) -> &AddonCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Installed modules, in load order.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    pub fn is_installed(&self, module: &str) -> bool {
        self.installed.iter().any(|m| m == module)
    }

    /// Superuser environment on a fresh transaction of the current registry.
    pub fn env(&self) -> Env {
        Env::superuser(self.registry.clone(), self.db.cursor())
    }

    fn build_registry(&self, modules: &[String]) -> Result<Registry, LoadError> {
        let mut defs = Vec::new();
        for module in modules {
            let addon = self.catalog.require(module)?;
            defs.extend(addon.models().into_iter().map(|def| def.in_module(module.as_str())));
        }
        let policy: Arc<dyn AccessPolicy> = if modules.iter().any(|m| m == strata_base::MODULE) {
            strata_base::access_policy()
        } else {
            Arc::new(AllowAll)
        };
        Ok(Registry::build(defs, policy)?)
    }

    /// Install `modules` with their dependencies.
    ///
    /// Dependency problems fail the whole call before anything is loaded.
    /// A module failing to load is rolled back and reported; the modules
    /// depending on it are skipped.
    #[instrument(skip(self), fields(db = %self.db.name()))]
    pub fn install(&mut self, modules: &[&str]) -> Result<LoadReport, LoadError> {
        let installed: BTreeSet<String> = self.installed.iter().cloned().collect();
        let plan = graph::resolve(&self.catalog, modules, &installed)?
            .into_iter()
            .filter(|m| !installed.contains(m))
            .map(|m| (m, Mode::Install))
            .collect();
        Ok(self.run(plan))
    }

    /// Reload `modules` (`["all"]` for every installed module) and the
    /// modules depending on them. New dependencies get installed first.
    #[instrument(skip(self), fields(db = %self.db.name()))]
    pub fn upgrade(&mut self, modules: &[&str]) -> Result<LoadReport, LoadError> {
        let targets: Vec<&str> = if modules == ["all"] {
            self.installed.iter().map(String::as_str).collect()
        } else {
            for module in modules {
                if !self.is_installed(module) {
                    return Err(LoadError::NotInstalled(module.to_string()));
                }
            }
            modules.to_vec()
        };
        let affected = graph::reverse_dependencies(&self.catalog, &self.installed, &targets);
        let wanted: Vec<&str> = affected.iter().map(String::as_str).collect();
        let installed: BTreeSet<String> = self.installed.iter().cloned().collect();
        let plan = graph::resolve(&self.catalog, &wanted, &installed)?
            .into_iter()
            .filter_map(|m| {
                if !installed.contains(&m) {
                    Some((m, Mode::Install))
                } else if affected.contains(&m) {
                    Some((m, Mode::Upgrade))
                } else {
                    None
                }
            })
            .collect();
        Ok(self.run(plan))
    }

    /// Rebuild the models of `module` and of the installed modules depending
    /// on it, then bring the tables in line. Data files are not replayed.
    #[instrument(skip(self), fields(db = %self.db.name()))]
    pub fn reload(&mut self, module: &str) -> Result<BTreeSet<String>, LoadError> {
        if !self.is_installed(module) {
            return Err(LoadError::NotInstalled(module.to_string()));
        }
        let affected = graph::reverse_dependencies(&self.catalog, &self.installed, &[module]);
        let registry = Arc::new(self.build_registry(&self.installed)?);
        let mut cursor = self.db.cursor();
        let changes = registry.reconcile_schema(&mut cursor)?;
        cursor.commit().map_err(OrmError::from)?;
        self.registry = registry;
        info!(module, affected = ?affected, changes = changes.len(), "registry reloaded");
        Ok(affected)
    }

    fn run(&mut self, plan: Vec<(String, Mode)>) -> LoadReport {
        let mut report = LoadReport::default();
        for (module, mode) in plan {
            let blocked = self
                .catalog
                .get(&module)
                .map(|a| a.manifest().dependencies())
                .unwrap_or_default()
                .into_iter()
                .find(|dep| report.is_broken(dep));
            if let Some(dep) = blocked {
                warn!(module = %module, dependency = %dep, "skipped: dependency failed");
                report.skipped.push(module);
                continue;
            }
            match self.load_module(&module, mode) {
                Ok(stats) => {
                    info!(
                        module = %module,
                        created = stats.created,
                        updated = stats.updated,
                        kept = stats.skipped,
                        "module {}",
                        if mode == Mode::Install { "installed" } else { "upgraded" }
                    );
                    match mode {
                        Mode::Install => report.installed.push(module),
                        Mode::Upgrade => report.upgraded.push(module),
                    }
                }
                Err(err) => {
                    error!(module = %module, error = %err, "module load failed, transaction rolled back");
                    report.fail(&module, err);
                }
            }
        }
        report
    }

    /// Load one module in its own transaction; the loader state only
    /// changes once that transaction committed.
    #[instrument(skip(self))]
    fn load_module(&mut self, module: &str, mode: Mode) -> Result<ApplyStats, LoadError> {
        let addon = self.catalog.require(module)?.clone();
        let mut modules = self.installed.clone();
        if !modules.iter().any(|m| m == module) {
            modules.push(module.to_string());
        }
        let registry = Arc::new(self.build_registry(&modules).map_err(|e| e.in_module(module))?);

        let mut cursor = self.db.cursor();
        let changes = registry
            .reconcile_schema(&mut cursor)
            .map_err(|e| LoadError::from(e).in_module(module))?;
        debug!(changes = changes.len(), "schema reconciled");
        let env = Env::superuser(registry.clone(), cursor);

        match self.play(&env, addon.as_ref(), mode) {
            Ok(stats) => {
                env.commit().map_err(|e| LoadError::from(e).in_module(module))?;
                self.registry = registry;
                if mode == Mode::Install {
                    self.installed.push(module.to_string());
                }
                Ok(stats)
            }
            Err(err) => {
                env.rollback();
                Err(err.in_module(module))
            }
        }
    }

    fn play(&self, env: &Env, addon: &dyn Addon, mode: Mode) -> Result<ApplyStats, LoadError> {
        let manifest = addon.manifest();
        let name = manifest.name.as_str();
        reflect_models(env)?;
        self.sync_module_list(env)?;
        let row = module_row(env, name)?;
        let transient = match mode {
            Mode::Install => ModuleState::ToInstall,
            Mode::Upgrade => ModuleState::ToUpgrade,
        };
        row.write_json(json!({ "state": transient.as_str() }))?;

        let mut applier = DataApplier::new(env, name);
        for path in &manifest.data {
            applier.apply_file(path, &addon.read_file(path)?)?;
        }
        let demo = !self.options.without_demo && !manifest.demo.is_empty();
        if demo {
            for path in &manifest.demo {
                applier.apply_file(path, &addon.read_file(path)?)?;
            }
        }
        for lang in active_languages(env)? {
            if let Some(contents) = addon.translation(&lang)? {
                let rows = parse_translations(name, &format!("i18n/{lang}.csv"), &contents)?;
                applier.apply_translations(&lang, &rows)?;
            }
        }
        if mode == Mode::Upgrade {
            remove_obsolete(env, name, applier.loaded())?;
        }

        row.write_json(json!({
            "state": ModuleState::Installed.as_str(),
            "latest_version": manifest.version,
            "demo": demo,
        }))?;
        Ok(applier.stats())
    }

    /// Make `ir.module.module` list every addon of the catalog.
    fn sync_module_list(&self, env: &Env) -> Result<(), LoadError> {
        let modules = env.model(MODULES)?;
        for manifest in self.catalog.manifests() {
            let mut vals = json!({
                "shortdesc": manifest.name,
                "summary": manifest.summary,
                "published_version": manifest.version,
                "dependencies": manifest.dependencies().join(","),
                "application": manifest.application,
                "auto_install": manifest.auto_install,
            });
            let existing = modules.search(&Domain::leaf("name", Operator::Eq, manifest.name.as_str()))?;
            if existing.is_empty() {
                let state = if manifest.installable {
                    ModuleState::Uninstalled
                } else {
                    ModuleState::Uninstallable
                };
                vals["name"] = json!(manifest.name);
                vals["state"] = json!(state.as_str());
                modules.create_one(vals)?;
            } else {
                existing.write_json(vals)?;
            }
        }
        Ok(())
    }

    /// Uninstall `modules` and every installed module depending on them.
    ///
    /// Records created by their data files are deleted; tables and columns
    /// stay in place.
    #[instrument(skip(self), fields(db = %self.db.name()))]
    pub fn uninstall(&mut self, modules: &[&str]) -> Result<LoadReport, LoadError> {
        for module in modules {
            if *module == strata_base::MODULE {
                return Err(LoadError::CannotUninstall(module.to_string()));
            }
            if !self.is_installed(module) {
                return Err(LoadError::NotInstalled(module.to_string()));
            }
        }
        let removing = graph::reverse_dependencies(&self.catalog, &self.installed, modules);
        let remaining: Vec<String> = self
            .installed
            .iter()
            .filter(|m| !removing.contains(*m))
            .cloned()
            .collect();
        let order: Vec<String> = self
            .installed
            .iter()
            .rev()
            .filter(|m| removing.contains(*m))
            .cloned()
            .collect();

        let next = Arc::new(self.build_registry(&remaining)?);
        let env = self.env();
        if let Err(err) = self.remove_modules(&env, &order, &next) {
            env.rollback();
            error!(error = %err, "uninstall failed, transaction rolled back");
            return Err(err);
        }
        env.commit()?;
        drop(env);

        // Models of the removed modules may have gone; columns they added stay.
        let mut cursor = self.db.cursor();
        next.reconcile_schema(&mut cursor)?;
        cursor.commit().map_err(OrmError::from)?;

        self.registry = next;
        self.installed = remaining;
        info!(modules = ?order, "modules uninstalled");
        Ok(LoadReport {
            removed: order,
            ..LoadReport::default()
        })
    }

    fn remove_modules(&self, env: &Env, order: &[String], next: &Registry) -> Result<(), LoadError> {
        for module in order {
            let row = module_row(env, module)?;
            row.write_json(json!({ "state": ModuleState::ToRemove.as_str() }))?;
            for entry in model_data::module_entries(env, module)?.iter().rev() {
                if entry.model != MODEL {
                    drop_entry(env, entry, false)?;
                }
            }
            row.write_json(json!({
                "state": ModuleState::Uninstalled.as_str(),
                "latest_version": false,
                "demo": false,
            }))?;
        }
        let gone: Vec<String> = self
            .registry
            .models()
            .filter(|m| !next.contains(&m.name))
            .map(|m| m.name.clone())
            .collect();
        if !gone.is_empty() {
            let rows = env
                .model(MODEL)?
                .search(&Domain::leaf("model", Operator::In, gone.clone()))?;
            rows.unlink()?;
            info!(models = ?gone, "models removed from the registry");
        }
        Ok(())
    }

    /// Activate language `code` and apply the installed modules' translations.
    #[instrument(skip(self), fields(db = %self.db.name()))]
    pub fn load_language(&self, code: &str) -> Result<usize, LoadError> {
        if !self.is_installed(strata_base::MODULE) {
            return Err(LoadError::NotInstalled(strata_base::MODULE.to_string()));
        }
        let env = self.env();
        let applied = (|| -> Result<usize, LoadError> {
            let langs = env.model(LANG)?.with_context_value("active_test", false);
            let found = langs.search(&Domain::leaf("code", Operator::Eq, code))?;
            if found.is_empty() {
                langs.create_one(json!({ "name": code, "code": code, "active": true }))?;
            } else {
                found.write_json(json!({ "active": true }))?;
            }
            let mut applied = 0;
            for module in &self.installed {
                let addon = self.catalog.require(module)?;
                if let Some(contents) = addon.translation(code)? {
                    let rows = parse_translations(module, &format!("i18n/{code}.csv"), &contents)?;
                    applied += DataApplier::new(&env, module).apply_translations(code, &rows)?;
                }
            }
            Ok(applied)
        })();
        match applied {
            Ok(applied) => {
                env.commit()?;
                info!(lang = code, applied, "language loaded");
                Ok(applied)
            }
            Err(err) => {
                env.rollback();
                Err(err)
            }
        }
    }
}

fn module_row(env: &Env, name: &str) -> Result<RecordSet, LoadError> {
    let rows = env
        .model(MODULES)?
        .search(&Domain::leaf("name", Operator::Eq, name))?;
    if rows.is_empty() {
        return Err(LoadError::UnknownModule(name.to_string()));
    }
    Ok(rows)
}

fn active_languages(env: &Env) -> Result<Vec<String>, LoadError> {
    let langs = env.model(LANG)?.search(&Domain::True)?;
    let mut codes = Vec::new();
    for lang in langs.iter() {
        let code = lang.get_text("code")?.unwrap_or_default();
        if code != DEFAULT_LANG {
            codes.push(code);
        }
    }
    Ok(codes)
}

/// Delete the record behind `entry` and the entry itself.
///
/// With `tolerant`, a record still referenced elsewhere is kept and only
/// reported.
fn drop_entry(env: &Env, entry: &XmlIdEntry, tolerant: bool) -> Result<(), LoadError> {
    if env.registry().contains(&entry.model) {
        let target = env.browse(&entry.model, [entry.res_id])?.exists()?;
        if !target.is_empty() {
            return match env.savepoint(|| target.unlink()) {
                Ok(()) => {
                    debug!(xml_id = %entry.xml_id, "record removed");
                    Ok(())
                }
                Err(err @ OrmError::Integrity(_)) if tolerant => {
                    warn!(xml_id = %entry.xml_id, error = %err, "obsolete record still referenced, kept");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            };
        }
    }
    if let Some(current) = model_data::lookup(env, &entry.xml_id)? {
        model_data::forget(env, &[current.id])?;
    }
    Ok(())
}

/// Delete the records a module created earlier but no longer declares.
fn remove_obsolete(env: &Env, module: &str, loaded: &BTreeSet<XmlId>) -> Result<usize, LoadError> {
    let mut removed = 0;
    for entry in model_data::module_entries(env, module)?.iter().rev() {
        if entry.noupdate || entry.model == MODEL || loaded.contains(&entry.xml_id) {
            continue;
        }
        warn!(xml_id = %entry.xml_id, model = %entry.model, "removing obsolete record");
        drop_entry(env, entry, true)?;
        removed += 1;
    }
    Ok(removed)
}
