//! Model registry of one database.
//!
//! Built from the ordered contributions of the installed modules. Building
//! merges inheritance, validates relations and dependency paths, and derives
//! the recomputation trigger graph. The result is immutable; a module install
//! builds a new registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use strata_core::{OrmError, OrmResult, Value};
use strata_infra::store::{ColumnDef, ColumnType, Cursor, OnDelete, SchemaChange, TableDef};
use tracing::{debug, info, instrument};

use crate::access::{AccessPolicy, AllowAll};
use crate::field::{Field, FieldType};
use crate::model::{Model, ModelDef, ModelKind, table_name};

/// Model holding the users referenced by the automatic `create_uid`/`write_uid` fields.
pub const USERS_MODEL: &str = "res.users";

/// Recomputation to schedule when a field changes.
///
/// The records of `model` to recompute are those reaching the modified
/// records through `path` (the modified records themselves when empty).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub model: String,
    pub field: String,
    pub path: Vec<String>,
}

pub struct Registry {
    models: IndexMap<String, Arc<Model>>,
    triggers: HashMap<(String, String), Vec<Trigger>>,
    ranks: HashMap<(String, String), usize>,
    /// Stored many2one fields pointing at each model.
    references: HashMap<String, Vec<(String, String)>>,
    policy: Arc<dyn AccessPolicy>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Build a registry from contributions given in module order.
    #[instrument(skip_all)]
    pub fn build(
        defs: impl IntoIterator<Item = ModelDef>,
        policy: Arc<dyn AccessPolicy>,
    ) -> OrmResult<Registry> {
        let mut order: Vec<String> = Vec::new();
        let mut contribs: HashMap<String, Vec<ModelDef>> = HashMap::new();
        for def in defs {
            for parent in def.inherit.iter().chain(def.inherits.iter().map(|(p, _)| p)) {
                if !contribs.contains_key(parent) {
                    return Err(OrmError::unknown_model(parent));
                }
            }
            match def.kind {
                ModelKind::New | ModelKind::Abstract => {
                    if contribs.contains_key(&def.name) {
                        return Err(OrmError::validation(format!(
                            "model '{}' is already defined",
                            def.name
                        )));
                    }
                    order.push(def.name.clone());
                    contribs.insert(def.name.clone(), vec![def]);
                }
                ModelKind::Extend => match contribs.get_mut(&def.name) {
                    Some(list) => list.push(def),
                    None => return Err(OrmError::unknown_model(&def.name)),
                },
            }
        }

        let mut resolved: HashMap<String, Model> = HashMap::new();
        for name in &order {
            resolve(name, &contribs, &mut resolved, &mut HashSet::new())?;
        }

        let has_users = resolved.get(USERS_MODEL).is_some_and(|m| !m.is_abstract);
        let mut models = IndexMap::new();
        for name in &order {
            if let Some(mut model) = resolved.remove(name) {
                if !model.is_abstract {
                    add_automatic_fields(&mut model, has_users);
                }
                models.insert(name.clone(), model);
            }
        }

        derive_relations(&mut models)?;
        let models: IndexMap<String, Arc<Model>> =
            models.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();

        let mut registry = Registry {
            models,
            triggers: HashMap::new(),
            ranks: HashMap::new(),
            references: HashMap::new(),
            policy,
        };
        registry.validate()?;
        registry.build_triggers()?;
        registry.build_references();
        info!(models = registry.models.len(), "registry built");
        Ok(registry)
    }

    /// Registry without access control.
    pub fn unrestricted(defs: impl IntoIterator<Item = ModelDef>) -> OrmResult<Registry> {
        Self::build(defs, Arc::new(AllowAll))
    }

    pub fn get(&self, name: &str) -> OrmResult<&Arc<Model>> {
        self.models
            .get(name)
            .ok_or_else(|| OrmError::unknown_model(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }

    pub fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    /// Recomputations to schedule when `field` of `model` changes.
    pub fn triggers(&self, model: &str, field: &str) -> &[Trigger] {
        self.triggers
            .get(&(model.to_string(), field.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Position of a stored computed field in dependency order.
    pub fn rank(&self, model: &str, field: &str) -> usize {
        self.ranks
            .get(&(model.to_string(), field.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Stored many2one fields `(model, field)` referencing `model`.
    pub fn references_to(&self, model: &str) -> &[(String, String)] {
        self.references
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn table_of(&self, model: &str) -> Option<String> {
        self.models
            .get(model)
            .filter(|m| !m.is_abstract)
            .map(|m| m.table.clone())
    }

    /// Desired definitions of every model table and link table.
    pub fn table_defs(&self) -> Vec<TableDef> {
        let mut defs: Vec<TableDef> = self
            .models
            .values()
            .filter(|m| !m.is_abstract)
            .map(|m| m.table_def(|c| self.table_of(c)))
            .collect();
        let mut links: BTreeMap<String, TableDef> = BTreeMap::new();
        for model in self.models.values().filter(|m| !m.is_abstract) {
            for field in model.fields.values() {
                let FieldType::Many2many {
                    comodel,
                    relation: Some(relation),
                    column1: Some(c1),
                    column2: Some(c2),
                } = &field.ty
                else {
                    continue;
                };
                let Some(target) = self.table_of(comodel) else {
                    continue;
                };
                links.entry(relation.clone()).or_insert_with(|| {
                    TableDef::new(relation)
                        .column(
                            ColumnDef::new(c1, ColumnType::Ref)
                                .references(&model.table, OnDelete::Cascade)
                                .not_null()
                                .indexed(),
                        )
                        .column(
                            ColumnDef::new(c2, ColumnType::Ref)
                                .references(&target, OnDelete::Cascade)
                                .not_null()
                                .indexed(),
                        )
                        .unique(format!("{relation}_pair"), &[c1, c2])
                });
            }
        }
        defs.extend(links.into_values());
        defs
    }

    /// Bring the cursor's tables in line with the registry. Never drops data.
    #[instrument(skip_all)]
    pub fn reconcile_schema(&self, cursor: &mut Cursor) -> OrmResult<Vec<SchemaChange>> {
        let mut changes = Vec::new();
        for def in self.table_defs() {
            changes.extend(cursor.reconcile(&def)?);
        }
        debug!(changes = changes.len(), "schema reconciled");
        Ok(changes)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────

    fn validate(&self) -> OrmResult<()> {
        for model in self.models.values() {
            for field in model.fields.values() {
                match &field.ty {
                    FieldType::Many2one { comodel, .. } | FieldType::Many2many { comodel, .. } => {
                        self.get(comodel)?;
                    }
                    FieldType::One2many { comodel, inverse } => {
                        let target = self.get(comodel)?;
                        if !target.field(inverse)?.is_many2one() {
                            return Err(OrmError::validation(format!(
                                "inverse '{comodel}.{inverse}' of '{}.{}' is not a many2one",
                                model.name, field.name
                            )));
                        }
                    }
                    _ => {}
                }
                if let Some(path) = &field.related {
                    self.walk(&model.name, path)?;
                }
                for dep in &field.depends {
                    let path: Vec<String> = dep.split('.').map(str::to_string).collect();
                    self.walk(&model.name, &path)?;
                }
            }
            if let Some(rec_name) = &model.rec_name {
                model.field(rec_name)?;
            }
            if let Some(parent) = &model.parent_name {
                match &model.field(parent)?.ty {
                    FieldType::Many2one { comodel, .. } if *comodel == model.name => {}
                    _ => {
                        return Err(OrmError::validation(format!(
                            "parent field '{}.{parent}' must reference '{}'",
                            model.name, model.name
                        )));
                    }
                }
            }
            for constraint in &model.constraints {
                for f in &constraint.fields {
                    model.field(f)?;
                }
            }
        }
        Ok(())
    }

    /// Follow `path` from `model`; returns the model and field reached last.
    pub fn walk<'a>(&'a self, model: &str, path: &[String]) -> OrmResult<(&'a Arc<Model>, &'a Field)> {
        let mut current = self.get(model)?;
        let (last, init) = path
            .split_last()
            .ok_or_else(|| OrmError::validation("empty field path"))?;
        for seg in init {
            let field = current.field(seg)?;
            let comodel = field.comodel().ok_or_else(|| {
                OrmError::validation(format!(
                    "field '{}.{seg}' is not relational and cannot be traversed",
                    current.name
                ))
            })?;
            current = self.get(comodel)?;
        }
        let field = current.field(last)?;
        Ok((current, field))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Trigger graph
    // ─────────────────────────────────────────────────────────────────────

    /// Dependency paths of a field with non-stored intermediate fields expanded.
    fn dependency_paths(&self, model: &str, field: &Field) -> OrmResult<Vec<Vec<String>>> {
        let mut raw: Vec<Vec<String>> = field
            .depends
            .iter()
            .map(|d| d.split('.').map(str::to_string).collect())
            .collect();
        if let Some(related) = &field.related {
            raw.push(related.clone());
        }
        let mut out = Vec::new();
        for path in raw {
            self.expand(model, path, &mut out, 0)?;
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn expand(&self, model: &str, path: Vec<String>, out: &mut Vec<Vec<String>>, depth: usize) -> OrmResult<()> {
        if depth > 16 {
            return Err(OrmError::validation(format!(
                "dependency path {} on '{model}' is too deep",
                path.join(".")
            )));
        }
        let mut current = self.get(model)?;
        for (i, seg) in path.iter().enumerate() {
            let field = current.field(seg)?;
            let last = i + 1 == path.len();
            if !field.is_stored() {
                if let Some(related) = &field.related {
                    let mut full = path[..i].to_vec();
                    full.extend(related.iter().cloned());
                    full.extend(path[i + 1..].iter().cloned());
                    self.expand(model, full, out, depth + 1)?;
                    if !last {
                        return Ok(());
                    }
                } else if field.compute.is_some() {
                    for dep in &field.depends {
                        let mut full = path[..i].to_vec();
                        full.extend(dep.split('.').map(str::to_string));
                        self.expand(model, full, out, depth + 1)?;
                    }
                    if !last {
                        return Ok(());
                    }
                }
            }
            if !last {
                match field.comodel() {
                    Some(comodel) => current = self.get(comodel)?,
                    None => return Err(OrmError::unknown_field(&current.name, &path[i + 1])),
                }
            }
        }
        out.push(path);
        Ok(())
    }

    fn build_triggers(&mut self) -> OrmResult<()> {
        let mut triggers: HashMap<(String, String), Vec<Trigger>> = HashMap::new();
        let mut edges: BTreeMap<(String, String), Vec<(String, String)>> = BTreeMap::new();

        for model in self.models.values().filter(|m| !m.is_abstract) {
            for field in model.fields.values() {
                if !field.is_recomputed() {
                    continue;
                }
                let node = (model.name.clone(), field.name.clone());
                let deps = edges.entry(node.clone()).or_default();
                for path in self.dependency_paths(&model.name, field)? {
                    let mut current = self.get(&model.name)?;
                    let mut prefix: Vec<String> = Vec::new();
                    for (i, seg) in path.iter().enumerate() {
                        let dep = current.field(seg)?;
                        let trigger = Trigger {
                            model: model.name.clone(),
                            field: field.name.clone(),
                            path: prefix.clone(),
                        };
                        triggers
                            .entry((current.name.clone(), seg.clone()))
                            .or_default()
                            .push(trigger);
                        if let FieldType::One2many { comodel, inverse } = &dep.ty {
                            let mut through = prefix.clone();
                            through.push(seg.clone());
                            triggers
                                .entry((comodel.clone(), inverse.clone()))
                                .or_default()
                                .push(Trigger {
                                    model: model.name.clone(),
                                    field: field.name.clone(),
                                    path: through,
                                });
                        }
                        let dep_node = (current.name.clone(), seg.clone());
                        if dep.is_recomputed() && dep_node != node {
                            deps.push(dep_node);
                        }
                        if i + 1 < path.len() {
                            if let Some(comodel) = dep.comodel() {
                                current = self.get(comodel)?;
                                prefix.push(seg.clone());
                            }
                        }
                    }
                }
            }
        }

        for list in triggers.values_mut() {
            let mut seen = HashSet::new();
            list.retain(|t| seen.insert(t.clone()));
        }

        let mut ranks: HashMap<(String, String), usize> = HashMap::new();
        let mut visiting: HashSet<(String, String)> = HashSet::new();
        for node in edges.keys() {
            rank_of(node, &edges, &mut ranks, &mut visiting)?;
        }

        debug!(triggers = triggers.len(), computed = ranks.len(), "trigger graph built");
        self.triggers = triggers;
        self.ranks = ranks;
        Ok(())
    }

    fn build_references(&mut self) {
        let mut references: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for model in self.models.values().filter(|m| !m.is_abstract) {
            for field in model.stored_fields() {
                if let (FieldType::Many2one { comodel, .. }, false) = (&field.ty, field.automatic) {
                    references
                        .entry(comodel.clone())
                        .or_default()
                        .push((model.name.clone(), field.name.clone()));
                }
            }
        }
        self.references = references;
    }
}

fn rank_of(
    node: &(String, String),
    edges: &BTreeMap<(String, String), Vec<(String, String)>>,
    ranks: &mut HashMap<(String, String), usize>,
    visiting: &mut HashSet<(String, String)>,
) -> OrmResult<usize> {
    if let Some(rank) = ranks.get(node) {
        return Ok(*rank);
    }
    if !visiting.insert(node.clone()) {
        return Err(OrmError::validation(format!(
            "cyclic dependency involving computed field '{}.{}'",
            node.0, node.1
        )));
    }
    let mut rank = 0;
    for dep in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        rank = rank.max(rank_of(dep, edges, ranks, visiting)? + 1);
    }
    visiting.remove(node);
    ranks.insert(node.clone(), rank);
    Ok(rank)
}

fn resolve(
    name: &str,
    contribs: &HashMap<String, Vec<ModelDef>>,
    resolved: &mut HashMap<String, Model>,
    visiting: &mut HashSet<String>,
) -> OrmResult<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(OrmError::validation(format!("model '{name}' inherits from itself")));
    }
    let list = contribs
        .get(name)
        .ok_or_else(|| OrmError::unknown_model(name))?;
    for def in list {
        for parent in def.inherit.iter().chain(def.inherits.iter().map(|(p, _)| p)) {
            resolve(parent, contribs, resolved, visiting)?;
        }
    }

    let first = &list[0];
    let mut model = Model {
        name: name.to_string(),
        description: name.to_string(),
        table: table_name(name),
        is_abstract: first.kind == ModelKind::Abstract,
        fields: IndexMap::new(),
        order: "id".to_string(),
        rec_name: None,
        parent_name: None,
        inherits: Vec::new(),
        constraints: Vec::new(),
        sql_constraints: Vec::new(),
        methods: BTreeMap::new(),
        display_name: None,
        modules: Vec::new(),
    };

    for def in list {
        for parent_name in &def.inherit {
            let Some(parent) = resolved.get(parent_name) else {
                return Err(OrmError::unknown_model(parent_name));
            };
            for (fname, f) in &parent.fields {
                if !f.automatic {
                    model.fields.insert(fname.clone(), f.clone());
                }
            }
            for (mname, chain) in &parent.methods {
                model
                    .methods
                    .entry(mname.clone())
                    .or_default()
                    .extend(chain.iter().cloned());
            }
            model.constraints.extend(parent.constraints.iter().cloned());
            model.sql_constraints.extend(parent.sql_constraints.iter().cloned());
            if parent.order != "id" {
                model.order = parent.order.clone();
            }
            model.rec_name = model.rec_name.take().or_else(|| parent.rec_name.clone());
            model.parent_name = model.parent_name.take().or_else(|| parent.parent_name.clone());
            model.display_name = model.display_name.take().or_else(|| parent.display_name.clone());
        }

        for field in &def.fields {
            let mut field = field.clone();
            let mut modules = model
                .fields
                .get(&field.name)
                .map(|f| f.modules.clone())
                .unwrap_or_default();
            modules.push(def.module.clone());
            field.modules = modules;
            model.fields.insert(field.name.clone(), field);
        }
        for method in &def.methods {
            model
                .methods
                .entry(method.name.clone())
                .or_default()
                .push(method.clone());
        }
        model.constraints.extend(def.constraints.iter().cloned());
        model.sql_constraints.extend(def.sql_constraints.iter().cloned());
        if let Some(d) = &def.description {
            model.description = d.clone();
        }
        if let Some(o) = &def.order {
            model.order = o.clone();
        }
        if let Some(r) = &def.rec_name {
            model.rec_name = Some(r.clone());
        }
        if let Some(p) = &def.parent_name {
            model.parent_name = Some(p.clone());
        }
        if let Some(n) = &def.display_name {
            model.display_name = Some(n.clone());
        }
        model.inherits.extend(def.inherits.iter().cloned());
        if !model.modules.contains(&def.module) {
            model.modules.push(def.module.clone());
        }
    }

    for (parent_name, link) in model.inherits.clone() {
        let Some(parent) = resolved.get(&parent_name) else {
            return Err(OrmError::unknown_model(&parent_name));
        };
        match model.fields.get_mut(&link) {
            Some(existing) => existing.delegate = true,
            None => {
                let mut f = Field::many2one(&link, &parent_name)
                    .required()
                    .on_delete(OnDelete::Cascade)
                    .index()
                    .copy(false);
                f.delegate = true;
                f.modules = model.modules.clone();
                model.fields.insert(link.clone(), f);
            }
        }
        for (fname, pf) in &parent.fields {
            if pf.automatic || model.fields.contains_key(fname) {
                continue;
            }
            let mut f = pf.clone();
            f.copy = Some(pf.is_copied());
            f.related = Some(vec![link.clone(), fname.clone()]);
            f.store = Some(false);
            f.compute = None;
            f.inverse = None;
            f.search = None;
            f.default = None;
            f.required = false;
            f.depends = Vec::new();
            model.fields.insert(fname.clone(), f);
        }
    }

    if model.rec_name.is_none() && model.fields.contains_key("name") {
        model.rec_name = Some("name".to_string());
    }

    visiting.remove(name);
    resolved.insert(name.to_string(), model);
    Ok(())
}

fn add_automatic_fields(model: &mut Model, has_users: bool) {
    let automatic = |f: Field| {
        let mut f = f.readonly().copy(false);
        f.automatic = true;
        f
    };
    let user_ref = |name: &str, label: &str| {
        let f = if has_users {
            let mut f = Field::many2one(name, USERS_MODEL);
            f.foreign_key = false;
            f
        } else {
            Field::integer(name)
        };
        automatic(f.string(label))
    };

    let mut fields = IndexMap::new();
    fields.insert("id".to_string(), automatic(Field::integer("id").string("ID")));
    for (name, field) in model.fields.drain(..) {
        if name != "id" {
            fields.insert(name, field);
        }
    }
    for f in [
        user_ref("create_uid", "Created by"),
        automatic(Field::datetime("create_date").string("Created on")),
        user_ref("write_uid", "Last Updated by"),
        automatic(Field::datetime("write_date").string("Last Updated on")),
    ] {
        fields.entry(f.name.clone()).or_insert(f);
    }
    if !fields.contains_key("display_name") {
        let depends: Vec<&str> = model.rec_name.as_deref().into_iter().collect();
        let f = Field::char("display_name")
            .compute(&depends, |rs| rs.display_name().map(Value::Text));
        fields.insert("display_name".to_string(), automatic(f));
    }
    model.fields = fields;
}

/// Derive link tables and columns of many2many fields.
fn derive_relations(models: &mut IndexMap<String, Model>) -> OrmResult<()> {
    let tables: HashMap<String, String> = models
        .values()
        .map(|m| (m.name.clone(), m.table.clone()))
        .collect();
    for model in models.values_mut() {
        let own = model.table.clone();
        for field in model.fields.values_mut() {
            if let FieldType::Many2many {
                comodel,
                relation,
                column1,
                column2,
            } = &mut field.ty
            {
                let other = tables
                    .get(comodel.as_str())
                    .cloned()
                    .ok_or_else(|| OrmError::unknown_model(comodel.as_str()))?;
                if relation.is_none() {
                    let (a, b) = if own <= other { (&own, &other) } else { (&other, &own) };
                    *relation = Some(format!("{a}_{b}_rel"));
                }
                if column1.is_none() || column2.is_none() {
                    if own == other {
                        *column1 = Some(format!("{own}_src_id"));
                        *column2 = Some(format!("{own}_dst_id"));
                    } else {
                        *column1 = Some(format!("{own}_id"));
                        *column2 = Some(format!("{other}_id"));
                    }
                }
            }
        }
    }
    Ok(())
}
