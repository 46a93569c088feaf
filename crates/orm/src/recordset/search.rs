use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_auth::AccessMode;
use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::{Col, Filter, OrderBy};
use tracing::debug;

use super::{RecordSet, localized};
use crate::compiler;
use crate::domain::{Domain, Operator};
use crate::field::FieldType;
use crate::model::Model;

/// Window and order of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    pub offset: usize,
    pub limit: Option<usize>,
    /// Comma-separated `field [asc|desc]` list; the model order when `None`.
    pub order: Option<String>,
}

impl SearchParams {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn order(order: impl Into<String>) -> Self {
        Self {
            order: Some(order.into()),
            ..Self::default()
        }
    }
}

/// Parse an order specification into store sort keys.
pub(crate) fn order_by(model: &Model, spec: &str, lang: &str) -> OrmResult<Vec<OrderBy>> {
    let mut keys = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut words = part.split_whitespace();
        let name = words.next().unwrap_or_default();
        let descending = match words.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(OrmError::validation(format!(
                    "invalid direction '{other}' in order '{spec}'"
                )));
            }
        };
        if words.next().is_some() {
            return Err(OrmError::validation(format!("invalid order '{spec}'")));
        }
        if name == "id" {
            keys.push(OrderBy {
                col: Col::new("id"),
                descending,
            });
            continue;
        }
        let field = model.field(name)?;
        if !field.has_column() {
            return Err(OrmError::validation(format!(
                "cannot order {} by non-stored field '{name}'",
                model.name
            )));
        }
        let col = if field.is_translated() {
            Col::translated(name, lang)
        } else {
            Col::new(name)
        };
        keys.push(OrderBy { col, descending });
    }
    Ok(keys)
}

/// Aggregate function of a `read_group` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl Aggregate {
    fn parse(name: &str) -> OrmResult<Self> {
        Ok(match name {
            "sum" => Aggregate::Sum,
            "count" => Aggregate::Count,
            "min" => Aggregate::Min,
            "max" => Aggregate::Max,
            "avg" => Aggregate::Avg,
            other => return Err(OrmError::validation(format!("unknown aggregate '{other}'"))),
        })
    }

    fn apply(self, values: &[Value]) -> JsonValue {
        let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
        match self {
            Aggregate::Count => json!(present.len()),
            Aggregate::Sum | Aggregate::Avg => {
                let numbers: Vec<f64> = present.iter().filter_map(|v| v.as_float()).collect();
                let all_int = present.iter().all(|v| matches!(v, Value::Int(_)));
                let sum: f64 = numbers.iter().sum();
                match self {
                    Aggregate::Avg if numbers.is_empty() => JsonValue::Bool(false),
                    Aggregate::Avg => json!(sum / numbers.len() as f64),
                    _ if all_int => json!(sum as i64),
                    _ => json!(sum),
                }
            }
            Aggregate::Min => present
                .iter()
                .min_by(|a, b| a.sort_cmp(b))
                .map(|v| v.to_json())
                .unwrap_or(JsonValue::Bool(false)),
            Aggregate::Max => present
                .iter()
                .max_by(|a, b| a.sort_cmp(b))
                .map(|v| v.to_json())
                .unwrap_or(JsonValue::Bool(false)),
        }
    }
}

/// Date bucket of a `read_group` groupby on a date or datetime field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Day,
    Month,
    Year,
}

impl Granularity {
    fn parse(name: &str) -> OrmResult<Self> {
        Ok(match name {
            "day" => Granularity::Day,
            "month" => Granularity::Month,
            "year" => Granularity::Year,
            other => return Err(OrmError::validation(format!("unknown date granularity '{other}'"))),
        })
    }

    fn bucket(self, value: &Value) -> Value {
        let date = match value {
            Value::Date(d) => *d,
            Value::DateTime(dt) => dt.date(),
            _ => return Value::Null,
        };
        let format = match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Month => "%Y-%m",
            Granularity::Year => "%Y",
        };
        Value::Text(date.format(format).to_string())
    }
}

struct GroupBy<'a> {
    spec: &'a str,
    field: &'a crate::field::Field,
    granularity: Option<Granularity>,
}

impl RecordSet {
    /// Filter of a user search: archive filtering and read rules included.
    fn search_filter(&self, domain: &Domain) -> OrmResult<Filter> {
        self.check_domain_readable(domain)?;
        let mut parts = vec![domain.clone()];
        if self.model.has_active() && self.env.context().active_test() && !domain.mentions("active") {
            parts.push(Domain::leaf("active", Operator::Eq, true));
        }
        parts.push(self.rule_domain(AccessMode::Read)?);
        compiler::compile(&self.env, &self.model, &Domain::and(parts))
    }

    /// Records matching `domain` in the model order.
    pub fn search(&self, domain: &Domain) -> OrmResult<RecordSet> {
        self.search_with(domain, &SearchParams::default())
    }

    pub fn search_with(&self, domain: &Domain, params: &SearchParams) -> OrmResult<RecordSet> {
        self.check_access(AccessMode::Read)?;
        let filter = self.search_filter(domain)?;
        let spec = params.order.as_deref().unwrap_or(&self.model.order);
        let order = order_by(&self.model, spec, self.env.lang())?;
        let ids = self.env.with_cursor(|cr| {
            cr.select_ids(&self.model.table, &filter, &order, params.offset, params.limit)
        })?;
        debug!(model = %self.model.name, %domain, found = ids.len(), "search");
        Ok(self.browse(ids))
    }

    pub fn search_count(&self, domain: &Domain) -> OrmResult<usize> {
        self.check_access(AccessMode::Read)?;
        let filter = self.search_filter(domain)?;
        Ok(self.env.with_cursor(|cr| cr.count(&self.model.table, &filter))?)
    }

    pub fn search_read(
        &self,
        domain: &Domain,
        fields: &[&str],
        params: &SearchParams,
    ) -> OrmResult<Vec<JsonMap<String, JsonValue>>> {
        self.search_with(domain, params)?.read(fields)
    }

    /// `(id, display name)` of records whose record name matches `name`.
    pub fn name_search(
        &self,
        name: &str,
        domain: &Domain,
        operator: Operator,
        limit: Option<usize>,
    ) -> OrmResult<Vec<(RecordId, String)>> {
        let mut parts = vec![domain.clone()];
        let matches_all = name.is_empty() && matches!(operator, Operator::ILike | Operator::Like);
        if !matches_all {
            let rec_name = self.model.rec_name.as_deref().ok_or_else(|| {
                OrmError::validation(format!("{} has no record name to search on", self.model.name))
            })?;
            parts.push(Domain::leaf(rec_name, operator, name));
        }
        let params = SearchParams {
            limit,
            ..SearchParams::default()
        };
        let records = self.search_with(&Domain::and(parts), &params)?;
        records
            .iter()
            .map(|r| Ok((r.ids[0], r.display_name()?)))
            .collect()
    }

    /// Aggregates of the records matching `domain`, grouped by `groupby`.
    ///
    /// `fields` lists `name:agg` entries (`sum`, `count`, `min`, `max`,
    /// `avg`); a bare numeric field is summed. Date groupbys accept a
    /// `:day`, `:month` or `:year` suffix (month by default). Each group
    /// carries its `__count` and the `__domain` selecting its records.
    pub fn read_group(
        &self,
        domain: &Domain,
        fields: &[&str],
        groupby: &[&str],
        params: &SearchParams,
    ) -> OrmResult<Vec<JsonMap<String, JsonValue>>> {
        let lang = self.env.lang().to_string();
        let mut groups = Vec::with_capacity(groupby.len());
        for spec in groupby {
            let (name, suffix) = match spec.split_once(':') {
                Some((name, suffix)) => (name, Some(suffix)),
                None => (*spec, None),
            };
            let field = self.model.field(name)?;
            self.check_field_readable(field)?;
            if !field.has_column() {
                return Err(OrmError::validation(format!(
                    "cannot group {} by non-stored field '{name}'",
                    self.model.name
                )));
            }
            let granularity = match (&field.ty, suffix) {
                (FieldType::Date | FieldType::Datetime, s) => Some(Granularity::parse(s.unwrap_or("month"))?),
                (_, None) => None,
                (_, Some(s)) => {
                    return Err(OrmError::validation(format!("'{name}' cannot be grouped by {s}")));
                }
            };
            groups.push(GroupBy {
                spec,
                field,
                granularity,
            });
        }

        let mut aggregates = Vec::new();
        for spec in fields {
            let (name, agg) = match spec.split_once(':') {
                Some((name, agg)) => (name, Aggregate::parse(agg)?),
                None => (*spec, Aggregate::Sum),
            };
            if name == "__count" || groups.iter().any(|g| g.field.name == name) {
                continue;
            }
            let field = self.model.field(name)?;
            self.check_field_readable(field)?;
            let numeric = matches!(
                field.ty,
                FieldType::Integer | FieldType::Float { .. } | FieldType::Monetary
            );
            if !field.has_column() || (!numeric && matches!(agg, Aggregate::Sum | Aggregate::Avg)) {
                continue;
            }
            aggregates.push((name.to_string(), field, agg));
        }

        let records = self.search(domain)?;
        let mut buckets: IndexMap<String, (Vec<Value>, Vec<RecordId>)> = IndexMap::new();
        for id in records.ids() {
            let mut key = Vec::with_capacity(groups.len());
            for g in &groups {
                let raw = localized(records.raw_value(*id, g.field)?, &lang);
                key.push(match g.granularity {
                    Some(gran) => gran.bucket(&raw),
                    None => raw,
                });
            }
            let fingerprint = JsonValue::Array(key.iter().map(Value::to_json).collect()).to_string();
            buckets
                .entry(fingerprint)
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(*id);
        }

        let mut rows: Vec<(Vec<Value>, JsonMap<String, JsonValue>)> = Vec::with_capacity(buckets.len());
        for (_, (key, ids)) in buckets {
            let mut row = JsonMap::new();
            let mut group_domain = vec![domain.clone()];
            for (g, value) in groups.iter().zip(&key) {
                let shown = match g.granularity {
                    Some(_) => value.to_json(),
                    None => g.field.convert_to_read(value, &self.env)?,
                };
                row.insert(g.spec.to_string(), shown);
                group_domain.push(group_leaf(g, value));
            }
            row.insert("__count".to_string(), json!(ids.len()));
            for (name, field, agg) in &aggregates {
                let mut values = Vec::with_capacity(ids.len());
                for id in &ids {
                    values.push(records.raw_value(*id, field)?);
                }
                row.insert(name.clone(), agg.apply(&values));
            }
            row.insert("__domain".to_string(), Domain::and(group_domain).to_json());
            rows.push((key, row));
        }

        match params.order.as_deref() {
            Some(spec) => {
                let mut words = spec.split_whitespace();
                let name = words.next().unwrap_or_default().to_string();
                let descending = words.next().is_some_and(|w| w.eq_ignore_ascii_case("desc"));
                rows.sort_by(|(_, a), (_, b)| {
                    let (a, b) = (a.get(&name), b.get(&name));
                    let ord = json_sort_key(a).sort_cmp(&json_sort_key(b));
                    if descending { ord.reverse() } else { ord }
                });
            }
            None => rows.sort_by(|(a, _), (b, _)| {
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.sort_cmp(y))
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        let rows = rows.into_iter().map(|(_, row)| row).skip(params.offset);
        Ok(match params.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }
}

fn group_leaf(group: &GroupBy<'_>, value: &Value) -> Domain {
    let name = group.field.name.as_str();
    match (group.granularity, value) {
        (_, Value::Null) => Domain::leaf(name, Operator::Eq, false),
        (Some(gran), Value::Text(bucket)) => {
            let (start, end) = bucket_range(gran, bucket);
            Domain::and([
                Domain::leaf(name, Operator::Ge, start),
                Domain::leaf(name, Operator::Lt, end),
            ])
        }
        (_, v) => Domain::leaf(name, Operator::Eq, v.to_json()),
    }
}

/// `[start, end)` dates covered by a bucket label.
fn bucket_range(gran: Granularity, bucket: &str) -> (String, String) {
    let parts: Vec<i32> = bucket.split('-').filter_map(|p| p.parse().ok()).collect();
    let (y, m, d) = (
        parts.first().copied().unwrap_or(1970),
        parts.get(1).copied().unwrap_or(1),
        parts.get(2).copied().unwrap_or(1),
    );
    let start = chrono::NaiveDate::from_ymd_opt(y, m as u32, d as u32);
    let end = start.and_then(|s| match gran {
        Granularity::Day => s.succ_opt(),
        Granularity::Month => s.checked_add_months(chrono::Months::new(1)),
        Granularity::Year => s.checked_add_months(chrono::Months::new(12)),
    });
    let fmt = |d: Option<chrono::NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
    (fmt(start), fmt(end))
}

fn json_sort_key(value: Option<&JsonValue>) -> Value {
    match value {
        None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => Value::Null,
        Some(JsonValue::Number(n)) => n.as_i64().map(Value::Int).unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or(0.0))),
        Some(JsonValue::String(s)) => Value::Text(s.clone()),
        Some(JsonValue::Array(pair)) => json_sort_key(pair.get(1)),
        Some(other) => Value::Text(other.to_string()),
    }
}
