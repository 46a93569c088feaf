use std::collections::BTreeSet;

use chrono::{SubsecRound, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_auth::AccessMode;
use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::{Col, Filter, OnDelete, StoreError, Values};
use tracing::{debug, instrument};

use super::{RecordSet, recompute};
use crate::commands::Command;
use crate::env::MODEL_DATA;
use crate::field::{Field, FieldDefault, FieldType};

type JsonObject = JsonMap<String, JsonValue>;

fn as_object(value: JsonValue) -> OrmResult<JsonObject> {
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(OrmError::validation(format!("expected an object of field values, got {other}"))),
    }
}

fn is_false(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Null | JsonValue::Bool(false))
}

impl RecordSet {
    /// Create one record per mapping of field values.
    ///
    /// Missing fields get their defaults; stored computed fields and their
    /// dependents are recomputed before this returns.
    #[instrument(skip_all, fields(model = %self.model.name, count = vals_list.len()))]
    pub fn create(&self, vals_list: Vec<JsonObject>) -> OrmResult<RecordSet> {
        if vals_list.is_empty() {
            return Ok(self.browse([]));
        }
        if self.model.is_abstract {
            return Err(OrmError::validation(format!(
                "cannot create records of abstract model {}",
                self.model.name
            )));
        }
        self.check_access(AccessMode::Create)?;
        self.env.savepoint(|| self.create_inner(vals_list))
    }

    /// Create a single record from a JSON object.
    pub fn create_one(&self, vals: JsonValue) -> OrmResult<RecordSet> {
        self.create(vec![as_object(vals)?])
    }

    fn create_inner(&self, vals_list: Vec<JsonObject>) -> OrmResult<RecordSet> {
        let mut ids = Vec::with_capacity(vals_list.len());
        let mut deferred = Vec::with_capacity(vals_list.len());
        let mut given: BTreeSet<String> = BTreeSet::new();
        for vals in vals_list {
            given.extend(vals.keys().cloned());
            let vals = self.add_missing_defaults(vals)?;
            let vals = self.create_delegated_parents(vals)?;
            let (mut columns, later) = self.split_values(&vals, None)?;
            for field in self.model.stored_fields() {
                if field.required
                    && !field.is_recomputed()
                    && !field.automatic
                    && columns.get(&field.name).is_none_or(Value::is_null)
                {
                    return Err(OrmError::validation(format!(
                        "field '{}' is required on {}",
                        field.string, self.model.name
                    )));
                }
            }
            self.stamp(&mut columns, true);
            let id = self
                .env
                .with_cursor(|cr| cr.insert(&self.model.table, columns))
                .map_err(|e| self.store_error(e))?;
            ids.push(id);
            deferred.push((id, later));
        }
        let records = self.browse(ids.clone());
        for (id, later) in deferred {
            self.browse([id]).write_deferred(&later)?;
        }

        let registry = self.env.registry().clone();
        for field in self.model.fields.values() {
            // Given related values were written through to their target.
            if field.is_recomputed() && (field.related.is_some() || !given.contains(&field.name)) {
                let rank = registry.rank(&self.model.name, &field.name);
                self.env
                    .with_queue(|q| q.push(rank, &self.model.name, &field.name, &ids));
            }
        }
        recompute::modified_all(&self.env, &self.model, &ids)?;
        self.env.flush()?;
        records.run_constraints(None)?;
        records.check_rules(AccessMode::Create)?;
        debug!(model = %self.model.name, ?ids, "created");
        Ok(records)
    }

    fn add_missing_defaults(&self, mut vals: JsonObject) -> OrmResult<JsonObject> {
        for (name, field) in &self.model.fields {
            if vals.contains_key(name) || field.automatic {
                continue;
            }
            if !field.is_stored() && !self.is_delegated(field) {
                continue;
            }
            if let Some(value) = self.env.context().default_for(name) {
                vals.insert(name.clone(), value.clone());
                continue;
            }
            match &field.default {
                Some(FieldDefault::Value(value)) => {
                    vals.insert(name.clone(), value.clone());
                }
                Some(FieldDefault::Func(func)) => {
                    vals.insert(name.clone(), func(&self.env)?);
                }
                None => {}
            }
        }
        Ok(vals)
    }

    fn is_delegated(&self, field: &Field) -> bool {
        match &field.related {
            Some(path) if path.len() == 2 => self
                .model
                .inherits
                .iter()
                .any(|(_, link)| *link == path[0] && path[1] == field.name),
            _ => false,
        }
    }

    /// Create (or update) the delegation parents and point the links at them.
    fn create_delegated_parents(&self, mut vals: JsonObject) -> OrmResult<JsonObject> {
        for (parent, link) in &self.model.inherits {
            let mut parent_vals = JsonObject::new();
            let names: Vec<String> = vals
                .keys()
                .filter(|k| {
                    self.model.fields.get(*k).is_some_and(|f| {
                        !f.has_column()
                            && f.related.as_deref().is_some_and(|p| p.len() == 2 && p[0] == *link)
                    })
                })
                .cloned()
                .collect();
            for name in names {
                if let Some(value) = vals.remove(&name) {
                    parent_vals.insert(name, value);
                }
            }
            match vals.get(link).and_then(JsonValue::as_i64) {
                Some(parent_id) => {
                    if !parent_vals.is_empty() {
                        self.env.browse(parent, [parent_id])?.write(&parent_vals)?;
                    }
                }
                None => {
                    let created = self.env.model(parent)?.create(vec![parent_vals])?;
                    vals.insert(link.clone(), json!(created.ensure_one()?));
                }
            }
        }
        Ok(vals)
    }

    /// Split values into column values and values written after the row exists.
    fn split_values(&self, vals: &JsonObject, id: Option<RecordId>) -> OrmResult<(Values, JsonObject)> {
        let lang = self.env.lang().to_string();
        let mut columns = Values::new();
        let mut later = JsonObject::new();
        for (name, value) in vals {
            let field = self.model.field(name)?;
            if field.automatic {
                continue;
            }
            self.check_field_writable(field)?;
            if field.has_column() && field.related.is_none() {
                let cached = field.convert_to_cache(value)?;
                let existing = match (id, field.is_translated()) {
                    (Some(id), true) => Some(self.raw_value(id, field)?),
                    _ => None,
                };
                columns.insert(name.clone(), field.convert_to_write(cached, existing.as_ref(), &lang));
            } else if field.is_x2many() || field.inverse.is_some() || field.related.is_some() {
                later.insert(name.clone(), value.clone());
            } else {
                debug!(model = %self.model.name, field = %name, "ignoring value of computed field");
            }
        }
        Ok((columns, later))
    }

    /// Fill the automatic audit columns.
    fn stamp(&self, columns: &mut Values, creating: bool) {
        let now = Value::DateTime(Utc::now().naive_utc().trunc_subsecs(0));
        let mut names = vec![("write_uid", "write_date")];
        if creating {
            names.push(("create_uid", "create_date"));
        }
        for (uid_field, date_field) in names {
            if let Ok(field) = self.model.field(uid_field) {
                let uid = if field.is_many2one() {
                    Value::Id(self.env.uid())
                } else {
                    Value::Int(self.env.uid())
                };
                columns.insert(uid_field.to_string(), uid);
            }
            if self.model.has_field(date_field) {
                columns.insert(date_field.to_string(), now.clone());
            }
        }
    }

    /// Map cursor errors, naming the violated unique constraint when known.
    fn store_error(&self, err: StoreError) -> OrmError {
        if let StoreError::UniqueViolation { constraint, .. } = &err {
            if let Some(c) = self
                .model
                .sql_constraints
                .iter()
                .find(|c| format!("{}_{}", self.model.table, c.name) == *constraint)
            {
                return OrmError::integrity(c.message.clone());
            }
        }
        err.into()
    }

    /// Write x2many commands, inverse fields and related fields of one record.
    fn write_deferred(&self, later: &JsonObject) -> OrmResult<()> {
        for (name, value) in later {
            let field = self.model.field(name)?;
            if field.is_x2many() && field.is_stored() {
                self.apply_commands(field, Command::parse_list(value)?)?;
            } else if let Some(inverse) = &field.inverse {
                let cached = field.convert_to_cache(value)?;
                inverse(self, &cached)?;
            } else if let Some(path) = &field.related {
                self.write_related(path, value)?;
            }
        }
        Ok(())
    }

    fn write_related(&self, path: &[String], value: &JsonValue) -> OrmResult<()> {
        let Some((last, hops)) = path.split_last() else {
            return Ok(());
        };
        let mut target = self.clone();
        for hop in hops {
            target = target.get_record(hop)?;
            if target.is_empty() {
                return Ok(());
            }
        }
        let mut vals = JsonObject::new();
        vals.insert(last.clone(), value.clone());
        target.write(&vals)
    }

    /// Apply link commands to x2many `field` of a single record.
    pub(crate) fn apply_commands(&self, field: &Field, commands: Vec<Command>) -> OrmResult<()> {
        let id = self.ensure_one()?;
        match &field.ty {
            FieldType::One2many { comodel, inverse } => {
                let targets = self.env.model(comodel)?;
                let inverse_field = targets.model.field(inverse)?;
                let delete_on_remove = inverse_field.required
                    || matches!(inverse_field.ty, FieldType::Many2one { on_delete: OnDelete::Cascade, .. });
                let link_vals = |target: JsonValue| {
                    let mut vals = JsonObject::new();
                    vals.insert(inverse.clone(), target);
                    vals
                };
                let detach = |cid: RecordId| -> OrmResult<()> {
                    let child = targets.browse([cid]).exists()?;
                    if delete_on_remove {
                        child.unlink()
                    } else {
                        child.write(&link_vals(JsonValue::Bool(false)))
                    }
                };
                for command in commands {
                    match command {
                        Command::Create(mut vals) => {
                            vals.insert(inverse.clone(), json!(id));
                            targets.create(vec![vals])?;
                        }
                        Command::Update(cid, vals) => targets.browse([cid]).write(&vals)?,
                        Command::Delete(cid) => targets.browse([cid]).exists()?.unlink()?,
                        Command::Unlink(cid) => detach(cid)?,
                        Command::Link(cid) => targets.browse([cid]).write(&link_vals(json!(id)))?,
                        Command::Clear => {
                            for cid in self.x2many_ids(id, field)? {
                                detach(cid)?;
                            }
                        }
                        Command::Set(wanted) => {
                            let current = self.x2many_ids(id, field)?;
                            for cid in current.iter().filter(|c| !wanted.contains(c)) {
                                detach(*cid)?;
                            }
                            let added: Vec<RecordId> =
                                wanted.iter().copied().filter(|c| !current.contains(c)).collect();
                            targets.browse(added).write(&link_vals(json!(id)))?;
                        }
                    }
                }
            }
            FieldType::Many2many {
                comodel,
                relation: Some(relation),
                column1: Some(column1),
                column2: Some(column2),
            } => {
                let targets = self.env.model(comodel)?;
                let linked = |cid: Option<RecordId>| -> OrmResult<Vec<RecordId>> {
                    let mut filters = vec![Filter::eq(column1.as_str(), Value::Id(id))];
                    if let Some(cid) = cid {
                        filters.push(Filter::eq(column2.as_str(), Value::Id(cid)));
                    }
                    let filter = Filter::and(filters);
                    Ok(self
                        .env
                        .with_cursor(|cr| cr.select(relation, &filter, &[], 0, None))?
                        .into_iter()
                        .map(|row| row.id)
                        .collect())
                };
                let drop_rows = |rows: Vec<RecordId>| -> OrmResult<()> {
                    self.env.with_cursor(|cr| {
                        rows.iter().try_for_each(|row| cr.delete(relation, *row))
                    })?;
                    Ok(())
                };
                let link = |cid: RecordId| -> OrmResult<()> {
                    if linked(Some(cid))?.is_empty() {
                        let mut row = Values::new();
                        row.insert(column1.clone(), Value::Id(id));
                        row.insert(column2.clone(), Value::Id(cid));
                        self.env.with_cursor(|cr| cr.insert(relation, row))?;
                    }
                    Ok(())
                };
                for command in commands {
                    match command {
                        Command::Create(vals) => {
                            let created = targets.create(vec![vals])?;
                            link(created.ensure_one()?)?;
                        }
                        Command::Update(cid, vals) => targets.browse([cid]).write(&vals)?,
                        Command::Delete(cid) => targets.browse([cid]).exists()?.unlink()?,
                        Command::Unlink(cid) => drop_rows(linked(Some(cid))?)?,
                        Command::Link(cid) => link(cid)?,
                        Command::Clear => drop_rows(linked(None)?)?,
                        Command::Set(wanted) => {
                            let rows = self.env.with_cursor(|cr| {
                                cr.select(relation, &Filter::eq(column1.as_str(), Value::Id(id)), &[], 0, None)
                            })?;
                            let stale: Vec<RecordId> = rows
                                .iter()
                                .filter(|row| row.get(column2).as_id().is_none_or(|t| !wanted.contains(&t)))
                                .map(|row| row.id)
                                .collect();
                            drop_rows(stale)?;
                            for cid in wanted {
                                link(cid)?;
                            }
                        }
                    }
                }
            }
            _ => {
                return Err(OrmError::validation(format!(
                    "field '{}' of {} does not take link commands",
                    field.name, self.model.name
                )));
            }
        }
        Ok(())
    }

    /// Write the same values on every record.
    #[instrument(skip_all, fields(model = %self.model.name, ids = ?self.ids))]
    pub fn write(&self, vals: &JsonObject) -> OrmResult<()> {
        if self.ids.is_empty() || vals.is_empty() {
            return Ok(());
        }
        self.check_access(AccessMode::Write)?;
        self.check_exists()?;
        self.check_rules(AccessMode::Write)?;
        self.env.savepoint(|| self.write_inner(vals))
    }

    pub fn write_json(&self, vals: JsonValue) -> OrmResult<()> {
        self.write(&as_object(vals)?)
    }

    fn write_inner(&self, vals: &JsonObject) -> OrmResult<()> {
        let names: Vec<String> = vals.keys().cloned().collect();
        for name in &names {
            let field = self.model.field(name)?;
            if field.required && !field.is_recomputed() && field.has_column() && is_false(&vals[name]) {
                return Err(OrmError::validation(format!(
                    "field '{}' is required on {}",
                    field.string, self.model.name
                )));
            }
        }
        recompute::modified(&self.env, &self.model, &names, &self.ids)?;
        let mut deferred = Vec::new();
        for id in &self.ids {
            let (mut columns, later) = self.split_values(vals, Some(*id))?;
            if !columns.is_empty() {
                self.stamp(&mut columns, false);
                self.env
                    .with_cursor(|cr| cr.update(&self.model.table, *id, columns.clone()))
                    .map_err(|e| self.store_error(e))?;
                self.env.with_cache(|c| {
                    for (name, value) in columns {
                        c.set(&self.model.name, *id, &name, value);
                    }
                });
            }
            deferred.push((*id, later));
        }
        for (id, later) in deferred {
            self.browse([id]).write_deferred(&later)?;
        }
        recompute::modified(&self.env, &self.model, &names, &self.ids)?;
        self.env.flush()?;
        self.run_constraints(Some(&names))
    }

    /// Run the check constraints touching `fields` (all when `None`).
    pub(crate) fn run_constraints(&self, fields: Option<&[String]>) -> OrmResult<()> {
        let records = self.exists()?;
        if records.is_empty() {
            return Ok(());
        }
        for constraint in &self.model.constraints {
            let applies = fields.is_none_or(|names| constraint.fields.iter().any(|f| names.contains(f)));
            if applies {
                (constraint.check)(&records)?;
            }
        }
        Ok(())
    }

    /// Delete the records, applying the delete policy of every reference.
    #[instrument(skip_all, fields(model = %self.model.name, ids = ?self.ids))]
    pub fn unlink(&self) -> OrmResult<()> {
        if self.ids.is_empty() {
            return Ok(());
        }
        self.check_access(AccessMode::Unlink)?;
        self.check_exists()?;
        self.check_rules(AccessMode::Unlink)?;
        self.env.savepoint(|| self.unlink_inner())
    }

    fn unlink_inner(&self) -> OrmResult<()> {
        let ids: Vec<RecordId> = self.ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let registry = self.env.registry().clone();
        recompute::modified_all(&self.env, &self.model, &ids)?;

        let references = registry.references_to(&self.model.name).to_vec();
        let mut actions = Vec::with_capacity(references.len());
        for (ref_model, ref_field) in &references {
            let model = registry.get(ref_model)?;
            let field = model.field(ref_field)?;
            let FieldType::Many2one { on_delete, .. } = field.ty else {
                continue;
            };
            let filter = Filter::In {
                col: Col::new(ref_field.as_str()),
                values: ids.iter().map(|id| Value::Id(*id)).collect(),
            };
            let mut referencing = self
                .env
                .with_cursor(|cr| cr.select_ids(&model.table, &filter, &[], 0, None))?;
            if *ref_model == self.model.name {
                referencing.retain(|r| !ids.contains(r));
            }
            if referencing.is_empty() {
                continue;
            }
            if on_delete == OnDelete::Restrict {
                return Err(OrmError::integrity(format!(
                    "cannot delete {}{:?}: still referenced by {} through '{}'",
                    self.model.name, ids, ref_model, ref_field
                )));
            }
            actions.push((ref_model.clone(), ref_field.clone(), on_delete, referencing));
        }

        let sudo = self.env.sudo();
        for (ref_model, ref_field, on_delete, referencing) in actions {
            let records = sudo.browse(&ref_model, referencing)?.exists()?;
            match on_delete {
                OnDelete::Cascade => records.unlink()?,
                _ => {
                    let mut vals = JsonObject::new();
                    vals.insert(ref_field, JsonValue::Bool(false));
                    records.write(&vals)?;
                }
            }
        }

        self.detach_self_references(&ids)?;
        if registry.contains(MODEL_DATA) {
            let data = registry.get(MODEL_DATA)?;
            let filter = Filter::and(vec![
                Filter::eq("model", self.model.name.as_str()),
                Filter::In {
                    col: Col::new("res_id"),
                    values: ids.iter().map(|id| Value::Int(*id)).collect(),
                },
            ]);
            let rows = self
                .env
                .with_cursor(|cr| cr.select_ids(&data.table, &filter, &[], 0, None))?;
            self.env
                .with_cursor(|cr| rows.iter().try_for_each(|row| cr.delete(&data.table, *row)))?;
            self.env.invalidate(MODEL_DATA, Some(&rows));
        }
        self.env
            .with_cursor(|cr| ids.iter().try_for_each(|id| cr.delete(&self.model.table, *id)))
            .map_err(|e| self.store_error(e))?;
        self.env.invalidate(&self.model.name, Some(&ids));
        debug!(model = %self.model.name, ?ids, "unlinked");
        self.env.flush()
    }

    /// Clear restricting references between the records being deleted.
    fn detach_self_references(&self, ids: &[RecordId]) -> OrmResult<()> {
        for field in self.model.stored_fields() {
            let FieldType::Many2one {
                comodel,
                on_delete: OnDelete::Restrict,
            } = &field.ty
            else {
                continue;
            };
            if *comodel != self.model.name || field.automatic {
                continue;
            }
            for id in ids {
                let target = self.raw_value(*id, field)?.as_id();
                if target.is_some_and(|t| ids.contains(&t)) {
                    let mut row = Values::new();
                    row.insert(field.name.clone(), Value::Null);
                    self.env.with_cursor(|cr| cr.update(&self.model.table, *id, row))?;
                }
            }
        }
        Ok(())
    }

    /// Values to create a duplicate of a single record.
    pub fn copy_data(&self) -> OrmResult<JsonObject> {
        let id = self.ensure_one()?;
        let mut vals = JsonObject::new();
        for field in self.model.fields.values() {
            if field.name == "id" || field.delegate {
                continue;
            }
            let copied = match (&field.related, self.is_delegated(field)) {
                (Some(path), true) => self
                    .env
                    .registry()
                    .walk(&self.model.name, path)
                    .is_ok_and(|(_, parent_field)| parent_field.is_copied()),
                _ => field.is_copied(),
            };
            if !copied {
                continue;
            }
            let value = match &field.ty {
                FieldType::One2many { comodel, inverse } => {
                    let children = self.env.browse(comodel, self.x2many_ids(id, field)?)?;
                    let mut commands = Vec::with_capacity(children.len());
                    for child in children.iter() {
                        let mut child_vals = child.copy_data()?;
                        child_vals.remove(inverse);
                        commands.push(Command::Create(child_vals).to_json());
                    }
                    JsonValue::Array(commands)
                }
                FieldType::Many2many { .. } => Command::Set(self.x2many_ids(id, field)?).to_json(),
                _ => field.convert_to_read(&self.raw_value(id, field)?, &self.env)?,
            };
            vals.insert(field.name.clone(), value);
        }
        Ok(vals)
    }

    /// Duplicate a single record, `default` overriding copied values.
    pub fn copy(&self, default: &JsonObject) -> OrmResult<RecordSet> {
        self.ensure_one()?;
        self.check_access(AccessMode::Read)?;
        self.check_exists()?;
        self.check_rules(AccessMode::Read)?;
        let mut vals = self.copy_data()?;
        for (k, v) in default {
            vals.insert(k.clone(), v.clone());
        }
        self.create(vec![vals])
    }

    /// Default values of `fields` (every field when empty).
    pub fn default_get(&self, fields: &[&str]) -> OrmResult<JsonObject> {
        let mut result = JsonObject::new();
        for (name, field) in &self.model.fields {
            if (!fields.is_empty() && !fields.contains(&name.as_str())) || field.automatic {
                continue;
            }
            if let Some(value) = self.env.context().default_for(name) {
                result.insert(name.clone(), value.clone());
                continue;
            }
            match &field.default {
                Some(FieldDefault::Value(value)) => {
                    result.insert(name.clone(), value.clone());
                }
                Some(FieldDefault::Func(func)) => {
                    result.insert(name.clone(), func(&self.env)?);
                }
                None => {}
            }
        }
        Ok(result)
    }

    pub fn action_archive(&self) -> OrmResult<()> {
        self.set_active(false)
    }

    pub fn action_unarchive(&self) -> OrmResult<()> {
        self.set_active(true)
    }

    fn set_active(&self, active: bool) -> OrmResult<()> {
        if !self.model.has_active() {
            return Err(OrmError::validation(format!(
                "{} records cannot be archived",
                self.model.name
            )));
        }
        self.set("active", active)
    }
}
