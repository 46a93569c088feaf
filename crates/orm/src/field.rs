//! Field descriptors.
//!
//! A [`Field`] declares the type, storage and behaviour of one attribute of a
//! model, and owns the conversions between the three value forms:
//!
//! - user input (JSON) → cache ([`Field::convert_to_cache`])
//! - cache → column value ([`Field::convert_to_write`])
//! - cache → user-facing forms ([`Field::convert_to_record`], [`Field::convert_to_read`])

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use strata_core::value::{DEFAULT_LANG, decode_binary, parse_date, parse_datetime};
use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::{ColumnDef, ColumnType, OnDelete};

use crate::domain::{Domain, Operator};
use crate::env::Env;
use crate::recordset::RecordSet;

/// Computes the value of a field for one record.
pub type ComputeFn = Arc<dyn Fn(&RecordSet) -> OrmResult<Value> + Send + Sync>;
/// Translates a value written on one record back to the fields it derives from.
pub type InverseFn = Arc<dyn Fn(&RecordSet, &Value) -> OrmResult<()> + Send + Sync>;
/// Translates a filter on a non-stored field into a domain over stored fields.
pub type SearchFn = Arc<dyn Fn(&Env, Operator, &JsonValue) -> OrmResult<Domain> + Send + Sync>;
/// Produces a default value at creation time.
pub type DefaultFn = Arc<dyn Fn(&Env) -> OrmResult<JsonValue> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Char { size: Option<usize> },
    Text,
    Html,
    Integer,
    Float { digits: Option<u32> },
    Monetary,
    Boolean,
    Date,
    Datetime,
    Binary,
    /// Tag/label pairs.
    Selection(Vec<(String, String)>),
    Many2one {
        comodel: String,
        on_delete: OnDelete,
    },
    One2many {
        comodel: String,
        inverse: String,
    },
    /// `relation`/`column1`/`column2` are derived by the registry when absent.
    Many2many {
        comodel: String,
        relation: Option<String>,
        column1: Option<String>,
        column2: Option<String>,
    },
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Char { .. } => "char",
            FieldType::Text => "text",
            FieldType::Html => "html",
            FieldType::Integer => "integer",
            FieldType::Float { .. } => "float",
            FieldType::Monetary => "monetary",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Binary => "binary",
            FieldType::Selection(_) => "selection",
            FieldType::Many2one { .. } => "many2one",
            FieldType::One2many { .. } => "one2many",
            FieldType::Many2many { .. } => "many2many",
        }
    }
}

#[derive(Clone)]
pub enum FieldDefault {
    Value(JsonValue),
    Func(DefaultFn),
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Value(v) => write!(f, "Value({v})"),
            FieldDefault::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// User-facing value of a field on one record.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Scalar(Value),
    Records(RecordSet),
}

#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub string: String,
    pub help: Option<String>,
    pub required: bool,
    pub readonly: bool,
    pub default: Option<FieldDefault>,
    /// Explicit storage choice; computed and related fields default to not stored.
    pub store: Option<bool>,
    pub index: bool,
    pub translate: bool,
    /// External ids of the groups allowed to see the field; empty means everybody.
    pub groups: Vec<String>,
    pub copy: Option<bool>,
    pub compute: Option<ComputeFn>,
    pub depends: Vec<String>,
    pub inverse: Option<InverseFn>,
    pub search: Option<SearchFn>,
    pub related: Option<Vec<String>>,
    /// Many2one implementing delegation inheritance.
    pub delegate: bool,
    /// Whether a many2one column carries a foreign key.
    pub foreign_key: bool,
    /// Automatic field maintained by the ORM itself.
    pub automatic: bool,
    /// Modules that contributed to this field, in load order.
    pub modules: Vec<String>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("store", &self.is_stored())
            .field("required", &self.required)
            .field("computed", &self.compute.is_some())
            .field("related", &self.related)
            .finish()
    }
}

fn label_of(name: &str) -> String {
    let base = name
        .strip_suffix("_ids")
        .or_else(|| name.strip_suffix("_id"))
        .unwrap_or(name);
    let mut label = String::with_capacity(base.len());
    for (i, word) in base.split('_').filter(|w| !w.is_empty()).enumerate() {
        if i > 0 {
            label.push(' ');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            label.extend(first.to_uppercase());
            label.push_str(chars.as_str());
        }
    }
    label
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        Self {
            string: label_of(&name),
            name,
            ty,
            help: None,
            required: false,
            readonly: false,
            default: None,
            store: None,
            index: false,
            translate: false,
            groups: Vec::new(),
            copy: None,
            compute: None,
            depends: Vec::new(),
            inverse: None,
            search: None,
            related: None,
            delegate: false,
            foreign_key: true,
            automatic: false,
            modules: Vec::new(),
        }
    }

    pub fn char(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Char { size: None })
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn html(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Html)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float { digits: None })
    }

    pub fn monetary(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Monetary)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Datetime)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Binary)
    }

    pub fn selection(name: impl Into<String>, options: &[(&str, &str)]) -> Self {
        Self::new(
            name,
            FieldType::Selection(
                options
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        )
    }

    pub fn many2one(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::Many2one {
                comodel: comodel.into(),
                on_delete: OnDelete::SetNull,
            },
        )
    }

    pub fn one2many(
        name: impl Into<String>,
        comodel: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            FieldType::One2many {
                comodel: comodel.into(),
                inverse: inverse.into(),
            },
        )
    }

    pub fn many2many(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::Many2many {
                comodel: comodel.into(),
                relation: None,
                column1: None,
                column2: None,
            },
        )
    }

    // ── builder ──────────────────────────────────────────────────────────

    pub fn string(mut self, label: impl Into<String>) -> Self {
        self.string = label.into();
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn default(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    pub fn default_fn(
        mut self,
        f: impl Fn(&Env) -> OrmResult<JsonValue> + Send + Sync + 'static,
    ) -> Self {
        self.default = Some(FieldDefault::Func(Arc::new(f)));
        self
    }

    pub fn store(mut self, store: bool) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn translate(mut self) -> Self {
        self.translate = true;
        self
    }

    pub fn groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = Some(copy);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        if let FieldType::Char { size: s } = &mut self.ty {
            *s = Some(size);
        }
        self
    }

    pub fn digits(mut self, digits: u32) -> Self {
        if let FieldType::Float { digits: d } = &mut self.ty {
            *d = Some(digits);
        }
        self
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        if let FieldType::Many2one { on_delete: o, .. } = &mut self.ty {
            *o = on_delete;
        }
        self
    }

    pub fn relation(
        mut self,
        table: impl Into<String>,
        column1: impl Into<String>,
        column2: impl Into<String>,
    ) -> Self {
        if let FieldType::Many2many {
            relation,
            column1: c1,
            column2: c2,
            ..
        } = &mut self.ty
        {
            *relation = Some(table.into());
            *c1 = Some(column1.into());
            *c2 = Some(column2.into());
        }
        self
    }

    /// Make the field computed from `depends` (dotted paths).
    pub fn compute(
        mut self,
        depends: &[&str],
        f: impl Fn(&RecordSet) -> OrmResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.depends = depends.iter().map(|d| d.to_string()).collect();
        self.compute = Some(Arc::new(f));
        self
    }

    pub fn inverse(
        mut self,
        f: impl Fn(&RecordSet, &Value) -> OrmResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.inverse = Some(Arc::new(f));
        self
    }

    pub fn search_with(
        mut self,
        f: impl Fn(&Env, Operator, &JsonValue) -> OrmResult<Domain> + Send + Sync + 'static,
    ) -> Self {
        self.search = Some(Arc::new(f));
        self
    }

    /// Shorthand for a chain of references ending on a field of the target.
    pub fn related(mut self, path: &str) -> Self {
        self.related = Some(path.split('.').map(str::to_string).collect());
        self
    }

    // ── properties ───────────────────────────────────────────────────────

    pub fn is_stored(&self) -> bool {
        self.store
            .unwrap_or(self.compute.is_none() && self.related.is_none())
    }

    pub fn is_computed(&self) -> bool {
        self.compute.is_some()
    }

    /// Stored and kept up to date by recomputation: computed fields and
    /// related fields with `store(true)`.
    pub fn is_recomputed(&self) -> bool {
        (self.compute.is_some() || self.related.is_some()) && self.is_stored()
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self.ty,
            FieldType::Many2one { .. } | FieldType::One2many { .. } | FieldType::Many2many { .. }
        )
    }

    pub fn is_x2many(&self) -> bool {
        matches!(
            self.ty,
            FieldType::One2many { .. } | FieldType::Many2many { .. }
        )
    }

    pub fn is_many2one(&self) -> bool {
        matches!(self.ty, FieldType::Many2one { .. })
    }

    /// Whether the field has a column in the model's table.
    pub fn has_column(&self) -> bool {
        self.is_stored() && !self.is_x2many()
    }

    pub fn comodel(&self) -> Option<&str> {
        match &self.ty {
            FieldType::Many2one { comodel, .. }
            | FieldType::One2many { comodel, .. }
            | FieldType::Many2many { comodel, .. } => Some(comodel),
            _ => None,
        }
    }

    pub fn is_copied(&self) -> bool {
        self.copy.unwrap_or(
            !self.automatic
                && !matches!(self.ty, FieldType::One2many { .. })
                && (self.is_stored() || self.inverse.is_some()),
        )
    }

    /// Translatable text field.
    pub fn is_translated(&self) -> bool {
        self.translate
            && matches!(
                self.ty,
                FieldType::Char { .. } | FieldType::Text | FieldType::Html
            )
    }

    /// Column definition of a field with a column.
    pub fn column(&self, comodel_table: Option<&str>) -> ColumnDef {
        let ty = match &self.ty {
            _ if self.is_translated() => ColumnType::Jsonb,
            FieldType::Char { size } => ColumnType::Varchar(*size),
            FieldType::Text | FieldType::Html => ColumnType::Text,
            FieldType::Integer => ColumnType::Integer,
            FieldType::Float { .. } | FieldType::Monetary => ColumnType::Float,
            FieldType::Boolean => ColumnType::Boolean,
            FieldType::Date => ColumnType::Date,
            FieldType::Datetime => ColumnType::Timestamp,
            FieldType::Binary => ColumnType::Bytea,
            FieldType::Selection(_) => ColumnType::Varchar(None),
            FieldType::Many2one { .. } => ColumnType::Ref,
            FieldType::One2many { .. } | FieldType::Many2many { .. } => ColumnType::Jsonb,
        };
        let mut col = ColumnDef::new(&self.name, ty);
        if self.index {
            col = col.indexed();
        }
        if let (FieldType::Many2one { on_delete, .. }, Some(table), true) =
            (&self.ty, comodel_table, self.foreign_key)
        {
            col = col.references(table, *on_delete);
        }
        col
    }

    // ── conversions ──────────────────────────────────────────────────────

    fn invalid(&self, value: &JsonValue) -> OrmError {
        OrmError::validation(format!(
            "invalid value {value} for {} field '{}'",
            self.ty.name(),
            self.name
        ))
    }

    /// Convert user input into the cache form, validating the declared type.
    ///
    /// Textual forms (as found in data files) are accepted for numbers,
    /// booleans, dates and references.
    pub fn convert_to_cache(&self, value: &JsonValue) -> OrmResult<Value> {
        if value.is_null() || (*value == JsonValue::Bool(false) && !matches!(self.ty, FieldType::Boolean)) {
            return Ok(match self.ty {
                FieldType::Boolean => Value::Bool(false),
                FieldType::One2many { .. } | FieldType::Many2many { .. } => Value::Ids(Vec::new()),
                _ => Value::Null,
            });
        }
        match &self.ty {
            FieldType::Char { size } => {
                let text = self.text_of(value)?;
                if let Some(size) = size {
                    if text.chars().count() > *size {
                        return Err(OrmError::validation(format!(
                            "value for field '{}' exceeds {size} characters",
                            self.name
                        )));
                    }
                }
                Ok(self.text_value(text))
            }
            FieldType::Text | FieldType::Html => Ok(self.text_value(self.text_of(value)?)),
            FieldType::Integer => match value {
                JsonValue::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Value::Int)
                    .ok_or_else(|| self.invalid(value)),
                JsonValue::Bool(b) => Ok(Value::Int(i64::from(*b))),
                JsonValue::String(s) if s.trim().is_empty() => Ok(Value::Null),
                JsonValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| self.invalid(value)),
                _ => Err(self.invalid(value)),
            },
            FieldType::Float { digits } => {
                let f = self.float_of(value)?;
                Ok(f.map_or(Value::Null, |f| Value::Float(round_to(f, *digits))))
            }
            FieldType::Monetary => {
                let f = self.float_of(value)?;
                Ok(f.map_or(Value::Null, |f| Value::Float(round_to(f, Some(2)))))
            }
            FieldType::Boolean => match value {
                JsonValue::Bool(b) => Ok(Value::Bool(*b)),
                JsonValue::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" => Ok(Value::Bool(true)),
                    "0" | "false" | "no" | "" => Ok(Value::Bool(false)),
                    _ => Err(self.invalid(value)),
                },
                _ => Err(self.invalid(value)),
            },
            FieldType::Date => match value {
                JsonValue::String(s) if s.trim().is_empty() => Ok(Value::Null),
                JsonValue::String(s) => parse_date(s).map(Value::Date),
                _ => Err(self.invalid(value)),
            },
            FieldType::Datetime => match value {
                JsonValue::String(s) if s.trim().is_empty() => Ok(Value::Null),
                JsonValue::String(s) => parse_datetime(s).map(Value::DateTime),
                _ => Err(self.invalid(value)),
            },
            FieldType::Binary => match value {
                JsonValue::String(s) if s.is_empty() => Ok(Value::Null),
                JsonValue::String(s) => decode_binary(s).map(Value::Binary),
                _ => Err(self.invalid(value)),
            },
            FieldType::Selection(options) => {
                let tag = self.text_of(value)?;
                if tag.is_empty() {
                    return Ok(Value::Null);
                }
                if options.iter().any(|(k, _)| *k == tag) {
                    Ok(Value::Text(tag))
                } else {
                    Err(OrmError::validation(format!(
                        "wrong value for field '{}': '{tag}' is not a valid selection",
                        self.name
                    )))
                }
            }
            FieldType::Many2one { .. } => id_of(value)
                .map(|id| id.map_or(Value::Null, Value::Id))
                .ok_or_else(|| self.invalid(value)),
            FieldType::One2many { .. } | FieldType::Many2many { .. } => match value {
                JsonValue::Array(items) => items
                    .iter()
                    .map(|v| id_of(v).flatten().ok_or_else(|| self.invalid(value)))
                    .collect::<OrmResult<Vec<_>>>()
                    .map(Value::Ids),
                _ => Err(self.invalid(value)),
            },
        }
    }

    fn text_of(&self, value: &JsonValue) -> OrmResult<String> {
        match value {
            JsonValue::String(s) => Ok(s.clone()),
            JsonValue::Number(n) => Ok(n.to_string()),
            _ => Err(self.invalid(value)),
        }
    }

    fn text_value(&self, text: String) -> Value {
        Value::Text(text)
    }

    fn float_of(&self, value: &JsonValue) -> OrmResult<Option<f64>> {
        match value {
            JsonValue::Number(n) => n.as_f64().map(Some).ok_or_else(|| self.invalid(value)),
            JsonValue::String(s) if s.trim().is_empty() => Ok(None),
            JsonValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.invalid(value)),
            _ => Err(self.invalid(value)),
        }
    }

    /// Convert a cache value into the column value to store.
    ///
    /// Translatable text written in `lang` is merged into the existing
    /// translations; the default language is always populated.
    pub fn convert_to_write(&self, value: Value, existing: Option<&Value>, lang: &str) -> Value {
        if !self.is_translated() {
            return value;
        }
        match value {
            Value::Text(text) => {
                let mut map = match existing {
                    Some(Value::Translated(map)) => map.clone(),
                    Some(Value::Text(old)) => BTreeMap::from([(DEFAULT_LANG.to_string(), old.clone())]),
                    _ => BTreeMap::new(),
                };
                if lang == DEFAULT_LANG || !map.contains_key(DEFAULT_LANG) {
                    map.insert(DEFAULT_LANG.to_string(), text.clone());
                }
                map.insert(lang.to_string(), text);
                Value::Translated(map)
            }
            other => other,
        }
    }

    /// Convert a cache value into the record form (recordsets for relations).
    pub fn convert_to_record(&self, value: Value, env: &Env) -> OrmResult<FieldValue> {
        Ok(match self.comodel() {
            Some(comodel) => FieldValue::Records(env.browse(comodel, value.as_ids())?),
            None => match value {
                Value::Translated(_) => FieldValue::Scalar(
                    value
                        .translation(env.lang())
                        .map(|s| Value::Text(s.to_string()))
                        .unwrap_or_default(),
                ),
                other => FieldValue::Scalar(other),
            },
        })
    }

    /// Convert a cache value into its wire form.
    pub fn convert_to_read(&self, value: &Value, env: &Env) -> OrmResult<JsonValue> {
        Ok(match (&self.ty, value) {
            (FieldType::Boolean, v) => JsonValue::Bool(v.is_truthy()),
            (_, Value::Null) => match self.ty {
                FieldType::One2many { .. } | FieldType::Many2many { .. } => JsonValue::Array(vec![]),
                _ => JsonValue::Bool(false),
            },
            (FieldType::Many2one { comodel, .. }, v) => match v.as_id() {
                Some(id) => {
                    let target = env.sudo().browse(comodel, [id])?;
                    let name = target
                        .display_name_of(id)
                        .unwrap_or_else(|_| format!("{comodel},{id}"));
                    serde_json::json!([id, name])
                }
                None => JsonValue::Bool(false),
            },
            (_, Value::Translated(_)) => value
                .translation(env.lang())
                .map(|s| JsonValue::String(s.to_string()))
                .unwrap_or(JsonValue::Bool(false)),
            (_, v) => v.to_json(),
        })
    }
}

/// Round to `digits` decimals (no rounding when `None`).
pub fn round_to(value: f64, digits: Option<u32>) -> f64 {
    match digits {
        Some(d) => {
            let factor = 10f64.powi(d as i32);
            (value * factor).round() / factor
        }
        None => value,
    }
}

/// Id of a reference given as `id`, `"id"`, `[id, name]` or false.
fn id_of(value: &JsonValue) -> Option<Option<RecordId>> {
    match value {
        JsonValue::Null | JsonValue::Bool(false) => Some(None),
        JsonValue::Number(n) => n.as_i64().filter(|id| *id > 0).map(Some),
        JsonValue::String(s) => s.trim().parse::<i64>().ok().filter(|id| *id > 0).map(Some),
        JsonValue::Array(pair) => pair.first().and_then(id_of),
        _ => None,
    }
}
