use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_auth::AccessMode;
use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::Filter;

use super::{RecordSet, localized, search};
use crate::field::{Field, FieldType, FieldValue};

impl RecordSet {
    /// Fetch the stored columns of record `id` into the cache.
    pub(crate) fn load(&self, id: RecordId) -> OrmResult<()> {
        if self.env.with_cache(|c| c.contains(&self.model.name, id)) {
            return Ok(());
        }
        let row = self
            .env
            .with_cursor(|cr| cr.get(&self.model.table, id))?
            .ok_or_else(|| {
                OrmError::missing(format!("record {}({id}) does not exist", self.model.name))
            })?;
        let values: HashMap<String, Value> = self
            .model
            .stored_fields()
            .map(|f| (f.name.clone(), row.get(&f.name)))
            .collect();
        self.env.with_cache(|c| c.insert_row(&self.model.name, id, values));
        Ok(())
    }

    /// Cache-form value of `field` on record `id`.
    pub(crate) fn raw_value(&self, id: RecordId, field: &Field) -> OrmResult<Value> {
        if field.name == "id" {
            return Ok(Value::Id(id));
        }
        if field.has_column() {
            self.load(id)?;
            return Ok(self
                .env
                .with_cache(|c| c.get(&self.model.name, id, &field.name).cloned())
                .unwrap_or_default());
        }
        if let (Some(path), false) = (&field.related, field.is_stored()) {
            return self.related_value(id, field, path);
        }
        if let (Some(compute), false) = (&field.compute, field.is_stored()) {
            return compute(&self.browse([id]));
        }
        if field.is_x2many() {
            return Ok(Value::Ids(self.x2many_ids(id, field)?));
        }
        Ok(Value::Null)
    }

    /// Targets of an x2many field, in the comodel's order.
    pub(crate) fn x2many_ids(&self, id: RecordId, field: &Field) -> OrmResult<Vec<RecordId>> {
        let Some(comodel_name) = field.comodel() else {
            return Ok(Vec::new());
        };
        let comodel = self.env.get_model(comodel_name)?;
        let mut filters = Vec::new();
        match &field.ty {
            FieldType::One2many { inverse, .. } => filters.push(Filter::eq(inverse.as_str(), Value::Id(id))),
            FieldType::Many2many {
                relation: Some(relation),
                column1: Some(column1),
                column2: Some(column2),
                ..
            } => {
                let links = self.env.with_cursor(|cr| {
                    cr.select(relation, &Filter::eq(column1.as_str(), Value::Id(id)), &[], 0, None)
                })?;
                let targets: Vec<RecordId> = links.iter().filter_map(|row| row.get(column2).as_id()).collect();
                filters.push(Filter::ids(&targets));
            }
            _ => return Ok(Vec::new()),
        }
        if comodel.has_active() && self.env.context().active_test() {
            filters.push(Filter::eq("active", true));
        }
        let order = search::order_by(&comodel, &comodel.order, self.env.lang())?;
        let filter = Filter::and(filters);
        Ok(self
            .env
            .with_cursor(|cr| cr.select_ids(&comodel.table, &filter, &order, 0, None))?)
    }

    pub(crate) fn related_value(&self, id: RecordId, field: &Field, path: &[String]) -> OrmResult<Value> {
        let Some((last, hops)) = path.split_last() else {
            return Ok(Value::Null);
        };
        let mut current = self.browse([id]).sudo();
        for hop in hops {
            let model = current.model.clone();
            let link = model.field(hop)?;
            let target = current.raw_value(current.ids[0], link)?.as_ids();
            let Some((comodel, first)) = link.comodel().zip(target.first()) else {
                return Ok(empty_value(field));
            };
            current = current.env.browse(comodel, [*first])?;
        }
        let model = current.model.clone();
        current.raw_value(current.ids[0], model.field(last)?)
    }

    /// Value of `field` on a single record.
    ///
    /// Relations read as ids, translatable text in the context language.
    /// No access checks apply.
    pub fn get(&self, field: &str) -> OrmResult<Value> {
        let id = self.ensure_one()?;
        let value = self.raw_value(id, self.model.field(field)?)?;
        Ok(localized(value, self.env.lang()))
    }

    /// Records referenced by relational `field` of a single record.
    pub fn get_record(&self, field: &str) -> OrmResult<RecordSet> {
        match self.get_value(field)? {
            FieldValue::Records(records) => Ok(records),
            FieldValue::Scalar(_) => Err(OrmError::validation(format!(
                "field '{field}' of {} is not relational",
                self.model.name
            ))),
        }
    }

    pub fn get_value(&self, field: &str) -> OrmResult<FieldValue> {
        let id = self.ensure_one()?;
        let f = self.model.field(field)?;
        f.convert_to_record(self.raw_value(id, f)?, &self.env)
    }

    pub fn get_text(&self, field: &str) -> OrmResult<Option<String>> {
        Ok(self.get(field)?.as_str().map(str::to_string))
    }

    /// Write one field on every record.
    pub fn set(&self, field: &str, value: impl Into<JsonValue>) -> OrmResult<()> {
        let mut vals = JsonMap::new();
        vals.insert(field.to_string(), value.into());
        self.write(&vals)
    }

    /// Wire-form values of `fields` (every visible field when empty).
    pub fn read(&self, fields: &[&str]) -> OrmResult<Vec<JsonMap<String, JsonValue>>> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }
        self.check_access(AccessMode::Read)?;
        self.check_exists()?;
        self.check_rules(AccessMode::Read)?;
        let mut selected: Vec<&Field> = Vec::new();
        if fields.is_empty() {
            for f in self.model.fields.values() {
                if self.field_visible(f)? {
                    selected.push(f);
                }
            }
        } else {
            for name in fields {
                let f = self.model.field(name)?;
                if self.field_visible(f)? {
                    selected.push(f);
                }
            }
        }
        let mut result = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let mut map = JsonMap::new();
            map.insert("id".to_string(), JsonValue::from(*id));
            for f in &selected {
                if f.name == "id" {
                    continue;
                }
                let value = self.raw_value(*id, f)?;
                map.insert(f.name.clone(), f.convert_to_read(&value, &self.env)?);
            }
            result.push(map);
        }
        Ok(result)
    }

    /// Display name of a single record.
    pub fn display_name(&self) -> OrmResult<String> {
        self.display_name_of(self.ensure_one()?)
    }

    pub(crate) fn display_name_of(&self, id: RecordId) -> OrmResult<String> {
        let record = self.browse([id]);
        if let Some(name_fn) = &self.model.display_name {
            return name_fn(&record);
        }
        let Some(rec_name) = &self.model.rec_name else {
            return Ok(format!("{},{id}", self.model.name));
        };
        let field = self.model.field(rec_name)?;
        let value = localized(record.raw_value(id, field)?, self.env.lang());
        Ok(match (&field.ty, &value) {
            (_, Value::Null) => String::new(),
            (FieldType::Many2one { comodel, .. }, Value::Id(target)) => {
                self.env.sudo().browse(comodel, [*target])?.display_name()?
            }
            (_, Value::Text(text)) => text.clone(),
            (_, other) => match other.to_json() {
                JsonValue::String(s) => s,
                json => json.to_string(),
            },
        })
    }

    /// The records that still exist.
    pub fn exists(&self) -> OrmResult<RecordSet> {
        let mut ids = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            if self.env.with_cursor(|cr| cr.exists(&self.model.table, *id))? {
                ids.push(*id);
            }
        }
        Ok(self.browse(ids))
    }
}

fn empty_value(field: &Field) -> Value {
    match field.ty {
        FieldType::One2many { .. } | FieldType::Many2many { .. } => Value::Ids(Vec::new()),
        FieldType::Boolean => Value::Bool(false),
        _ => Value::Null,
    }
}
