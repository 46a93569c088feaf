use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_auth::AccessMode;
use strata_core::{OrmError, OrmResult, RecordId};

use super::{RecordSet, SearchParams};
use crate::domain::{Domain, Operator};
use crate::field::{Field, FieldType};
use crate::model::{Model, Super};

/// Methods every model answers without contributing an implementation.
pub const BUILTIN_METHODS: &[&str] = &[
    "create",
    "read",
    "write",
    "unlink",
    "search",
    "search_count",
    "search_read",
    "name_search",
    "fields_get",
    "default_get",
    "copy",
    "read_group",
    "exists",
    "action_archive",
    "action_unarchive",
];

/// Built-ins called on records: their first positional argument is the id list.
const RECORD_BUILTINS: &[&str] = &[
    "read",
    "write",
    "unlink",
    "copy",
    "exists",
    "action_archive",
    "action_unarchive",
];

/// Whether RPC calls of `method` on `model` pass the id list first.
pub fn takes_ids(model: &Model, method: &str) -> bool {
    match model.method_chain(method).last() {
        Some(m) => !m.model_level,
        None => RECORD_BUILTINS.contains(&method),
    }
}

type Kwargs = JsonMap<String, JsonValue>;

/// Positional argument `index`, or keyword `name`.
fn arg<'a>(args: &'a [JsonValue], kwargs: &'a Kwargs, index: usize, name: &str) -> Option<&'a JsonValue> {
    kwargs
        .get(name)
        .or_else(|| args.get(index))
        .filter(|v| !v.is_null())
}

fn domain_arg(args: &[JsonValue], kwargs: &Kwargs, index: usize, name: &str) -> OrmResult<Domain> {
    match arg(args, kwargs, index, name) {
        Some(value) => Domain::from_json(value),
        None => Ok(Domain::True),
    }
}

fn names_arg(args: &[JsonValue], kwargs: &Kwargs, index: usize, name: &str) -> OrmResult<Vec<String>> {
    match arg(args, kwargs, index, name) {
        None | Some(JsonValue::Bool(false)) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| OrmError::validation(format!("'{name}' must list names, got {v}")))
            })
            .collect(),
        Some(JsonValue::String(s)) => Ok(vec![s.clone()]),
        Some(other) => Err(OrmError::validation(format!("'{name}' must list names, got {other}"))),
    }
}

fn usize_arg(args: &[JsonValue], kwargs: &Kwargs, index: usize, name: &str) -> OrmResult<Option<usize>> {
    match arg(args, kwargs, index, name) {
        None | Some(JsonValue::Bool(false)) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| OrmError::validation(format!("'{name}' must be a non-negative integer, got {value}"))),
    }
}

fn object_arg(args: &[JsonValue], kwargs: &Kwargs, index: usize, name: &str) -> OrmResult<Kwargs> {
    match arg(args, kwargs, index, name) {
        None | Some(JsonValue::Bool(false)) => Ok(Kwargs::new()),
        Some(JsonValue::Object(map)) => Ok(map.clone()),
        Some(other) => Err(OrmError::validation(format!("'{name}' must be an object, got {other}"))),
    }
}

fn params_arg(args: &[JsonValue], kwargs: &Kwargs, first: usize) -> OrmResult<SearchParams> {
    Ok(SearchParams {
        offset: usize_arg(args, kwargs, first, "offset")?.unwrap_or(0),
        limit: usize_arg(args, kwargs, first + 1, "limit")?,
        order: arg(args, kwargs, first + 2, "order")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    })
}

fn as_strs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

impl RecordSet {
    /// Call `method` the way RPC does: through the override chain down to
    /// the built-in implementation.
    pub fn call(&self, method: &str, args: &[JsonValue], kwargs: &Kwargs) -> OrmResult<JsonValue> {
        let chain = self.model.method_chain(method);
        if chain.is_empty() && !BUILTIN_METHODS.contains(&method) {
            return Err(OrmError::missing(format!(
                "method '{method}' does not exist on {}",
                self.model.name
            )));
        }
        Super::new(method, chain).call(self, args, kwargs)
    }

    /// Whether `method` may be called over RPC.
    pub fn is_public_method(&self, method: &str) -> bool {
        if method.starts_with('_') {
            return false;
        }
        match self.model.method_chain(method).last() {
            Some(m) => m.public,
            None => BUILTIN_METHODS.contains(&method),
        }
    }

    /// Built-in implementation of `method`, below every override.
    pub(crate) fn call_builtin(&self, method: &str, args: &[JsonValue], kwargs: &Kwargs) -> OrmResult<JsonValue> {
        match method {
            "create" => {
                let (list, single) = match arg(args, kwargs, 0, "vals_list") {
                    Some(JsonValue::Object(vals)) => (vec![vals.clone()], true),
                    Some(JsonValue::Array(items)) => (
                        items
                            .iter()
                            .map(|v| match v {
                                JsonValue::Object(vals) => Ok(vals.clone()),
                                other => Err(OrmError::validation(format!("create expects objects, got {other}"))),
                            })
                            .collect::<OrmResult<Vec<_>>>()?,
                        false,
                    ),
                    None => (vec![Kwargs::new()], true),
                    Some(other) => {
                        return Err(OrmError::validation(format!("create expects objects, got {other}")));
                    }
                };
                let created = self.create(list)?;
                Ok(if single {
                    json!(created.ensure_one()?)
                } else {
                    json!(created.ids())
                })
            }
            "read" => {
                let fields = names_arg(args, kwargs, 0, "fields")?;
                Ok(json!(self.read(&as_strs(&fields))?))
            }
            "write" => {
                self.write(&object_arg(args, kwargs, 0, "vals")?)?;
                Ok(JsonValue::Bool(true))
            }
            "unlink" => {
                self.unlink()?;
                Ok(JsonValue::Bool(true))
            }
            "search" => {
                let domain = domain_arg(args, kwargs, 0, "domain")?;
                let found = self.search_with(&domain, &params_arg(args, kwargs, 1)?)?;
                Ok(json!(found.ids()))
            }
            "search_count" => {
                let domain = domain_arg(args, kwargs, 0, "domain")?;
                Ok(json!(self.search_count(&domain)?))
            }
            "search_read" => {
                let domain = domain_arg(args, kwargs, 0, "domain")?;
                let fields = names_arg(args, kwargs, 1, "fields")?;
                let params = params_arg(args, kwargs, 2)?;
                Ok(json!(self.search_read(&domain, &as_strs(&fields), &params)?))
            }
            "name_search" => {
                let name = arg(args, kwargs, 0, "name").and_then(JsonValue::as_str).unwrap_or("");
                let domain = domain_arg(args, kwargs, 1, "args")?;
                let operator = match arg(args, kwargs, 2, "operator").and_then(JsonValue::as_str) {
                    Some(op) => op.parse::<Operator>()?,
                    None => Operator::ILike,
                };
                let limit = usize_arg(args, kwargs, 3, "limit")?.or(Some(100));
                let pairs = self.name_search(name, &domain, operator, limit)?;
                Ok(JsonValue::Array(pairs.into_iter().map(|(id, name)| json!([id, name])).collect()))
            }
            "fields_get" => {
                let fields = names_arg(args, kwargs, 0, "allfields")?;
                let attributes = names_arg(args, kwargs, 1, "attributes")?;
                Ok(JsonValue::Object(self.fields_get(&as_strs(&fields), &as_strs(&attributes))?))
            }
            "default_get" => {
                let fields = names_arg(args, kwargs, 0, "fields_list")?;
                Ok(JsonValue::Object(self.default_get(&as_strs(&fields))?))
            }
            "copy" => {
                let copied = self.copy(&object_arg(args, kwargs, 0, "default")?)?;
                Ok(json!(copied.ensure_one()?))
            }
            "read_group" => {
                let domain = domain_arg(args, kwargs, 0, "domain")?;
                let fields = names_arg(args, kwargs, 1, "fields")?;
                let groupby = names_arg(args, kwargs, 2, "groupby")?;
                let params = SearchParams {
                    offset: usize_arg(args, kwargs, 3, "offset")?.unwrap_or(0),
                    limit: usize_arg(args, kwargs, 4, "limit")?,
                    order: arg(args, kwargs, 5, "orderby")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                };
                let groups = self.read_group(&domain, &as_strs(&fields), &as_strs(&groupby), &params)?;
                Ok(json!(groups))
            }
            "exists" => {
                self.check_access(AccessMode::Read)?;
                Ok(json!(self.exists()?.ids()))
            }
            "action_archive" => {
                self.action_archive()?;
                Ok(JsonValue::Bool(true))
            }
            "action_unarchive" => {
                self.action_unarchive()?;
                Ok(JsonValue::Bool(true))
            }
            other => Err(OrmError::missing(format!(
                "method '{other}' does not exist on {}",
                self.model.name
            ))),
        }
    }

    /// Field descriptions, restricted to `fields` and `attributes` when non-empty.
    pub fn fields_get(&self, fields: &[&str], attributes: &[&str]) -> OrmResult<Kwargs> {
        let mut result = Kwargs::new();
        for (name, field) in &self.model.fields {
            if !fields.is_empty() && !fields.contains(&name.as_str()) {
                continue;
            }
            if !self.field_visible(field)? {
                continue;
            }
            let mut desc = describe(field);
            if !attributes.is_empty() {
                desc.retain(|k, _| attributes.contains(&k.as_str()));
            }
            result.insert(name.clone(), JsonValue::Object(desc));
        }
        Ok(result)
    }

    /// Ids given as the first positional argument of a record method.
    pub fn ids_from_json(value: &JsonValue) -> OrmResult<Vec<RecordId>> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(|id| vec![id])
                .ok_or_else(|| OrmError::validation(format!("invalid record id {n}"))),
            JsonValue::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_i64()
                        .ok_or_else(|| OrmError::validation(format!("invalid record id {v}")))
                })
                .collect(),
            JsonValue::Null | JsonValue::Bool(false) => Ok(Vec::new()),
            other => Err(OrmError::validation(format!("expected a list of ids, got {other}"))),
        }
    }
}

fn describe(field: &Field) -> Kwargs {
    let mut desc = Kwargs::new();
    desc.insert("type".into(), json!(field.ty.name()));
    desc.insert("string".into(), json!(field.string));
    if let Some(help) = &field.help {
        desc.insert("help".into(), json!(help));
    }
    desc.insert("required".into(), json!(field.required));
    desc.insert("readonly".into(), json!(field.readonly || (field.is_computed() && field.inverse.is_none())));
    desc.insert("store".into(), json!(field.is_stored()));
    desc.insert("searchable".into(), json!(field.is_stored() || field.search.is_some() || field.related.is_some()));
    desc.insert("sortable".into(), json!(field.has_column()));
    desc.insert("translate".into(), json!(field.is_translated()));
    if let Some(comodel) = field.comodel() {
        desc.insert("relation".into(), json!(comodel));
    }
    match &field.ty {
        FieldType::One2many { inverse, .. } => {
            desc.insert("relation_field".into(), json!(inverse));
        }
        FieldType::Selection(options) => {
            desc.insert("selection".into(), json!(options));
        }
        FieldType::Char { size: Some(size) } => {
            desc.insert("size".into(), json!(size));
        }
        FieldType::Float { digits: Some(digits) } => {
            desc.insert("digits".into(), json!(digits));
        }
        _ => {}
    }
    if let Some(path) = &field.related {
        desc.insert("related".into(), json!(path.join(".")));
    }
    if field.is_computed() {
        desc.insert("depends".into(), json!(field.depends));
    }
    desc
}
