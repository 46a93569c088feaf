//! Compilation of domains into store filters.
//!
//! Dotted paths over single references become joins; over one2many and
//! many2many fields they become existence tests on the target (or link)
//! table. Negative operators (`!=`, `not in`, `not like`, ...) select the
//! complement of their positive counterpart, nulls included.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::{CmpOp, Col, Filter};
use tracing::trace;

use crate::domain::{Domain, Operator};
use crate::env::Env;
use crate::field::{Field, FieldType};
use crate::model::Model;

pub(crate) fn compile(env: &Env, model: &Model, domain: &Domain) -> OrmResult<Filter> {
    let filter = match domain {
        Domain::True => Filter::True,
        Domain::False => Filter::False,
        Domain::And(items) => Filter::and(
            items
                .iter()
                .map(|d| compile(env, model, d))
                .collect::<OrmResult<_>>()?,
        ),
        Domain::Or(items) => Filter::or(
            items
                .iter()
                .map(|d| compile(env, model, d))
                .collect::<OrmResult<_>>()?,
        ),
        Domain::Not(inner) => Filter::not(compile(env, model, inner)?),
        Domain::Leaf { path, op, value } => leaf(env, model, path, *op, value)?,
    };
    trace!(model = %model.name, ?filter, "domain compiled");
    Ok(filter)
}

/// Ids of `model` matching `domain`, without access rules or archive filtering.
pub(crate) fn search_ids(env: &Env, model: &Model, domain: &Domain) -> OrmResult<Vec<RecordId>> {
    let filter = compile(env, model, domain)?;
    Ok(env.with_cursor(|cr| cr.select_ids(&model.table, &filter, &[], 0, None))?)
}

fn leaf(env: &Env, model: &Model, path: &str, op: Operator, value: &JsonValue) -> OrmResult<Filter> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if head == "id" && rest.is_none() {
        return id_leaf(env, model, op, value);
    }
    let field = model.field(head)?;

    if !field.is_stored() {
        if let Some(related) = &field.related {
            let mut full = related.join(".");
            if let Some(rest) = rest {
                full.push('.');
                full.push_str(rest);
            }
            return compile(env, model, &Domain::leaf(full, op, value.clone()));
        }
        if let Some(search) = &field.search {
            if rest.is_some() {
                return Err(OrmError::validation(format!(
                    "cannot traverse computed field '{}.{head}'",
                    model.name
                )));
            }
            let domain = search(env, op, value)?;
            return compile(env, model, &domain);
        }
        return Err(OrmError::validation(format!(
            "non-stored field '{}.{head}' cannot be searched",
            model.name
        )));
    }

    if let Some(rest) = rest {
        let comodel = comodel_of(env, model, field)?;
        let sub = Domain::leaf(rest, op, value.clone());
        return relational_any(env, field, &comodel, &sub);
    }

    match &field.ty {
        FieldType::Many2one { .. } => many2one_leaf(env, model, field, op, value),
        FieldType::One2many { .. } | FieldType::Many2many { .. } => {
            x2many_leaf(env, model, field, op, value)
        }
        _ => scalar_leaf(env, model, field, op, value),
    }
}

fn comodel_of(env: &Env, model: &Model, field: &Field) -> OrmResult<std::sync::Arc<Model>> {
    let comodel = field.comodel().ok_or_else(|| {
        OrmError::validation(format!(
            "field '{}.{}' is not relational and cannot be traversed",
            model.name, field.name
        ))
    })?;
    env.get_model(comodel)
}

/// Records whose relation `field` reaches some target matching `sub`.
fn relational_any(env: &Env, field: &Field, comodel: &Model, sub: &Domain) -> OrmResult<Filter> {
    let inner = compile(env, comodel, sub)?;
    reaching(field, comodel, inner)
}

fn reaching(field: &Field, comodel: &Model, inner: Filter) -> OrmResult<Filter> {
    Ok(match &field.ty {
        FieldType::Many2one { .. } => Filter::Join {
            col: field.name.clone(),
            table: comodel.table.clone(),
            filter: Box::new(inner),
        },
        FieldType::One2many { inverse, .. } => Filter::Exists {
            table: comodel.table.clone(),
            column: inverse.clone(),
            filter: Box::new(inner),
        },
        FieldType::Many2many {
            relation: Some(relation),
            column1: Some(column1),
            column2: Some(column2),
            ..
        } => Filter::Exists {
            table: relation.clone(),
            column: column1.clone(),
            filter: Box::new(Filter::Join {
                col: column2.clone(),
                table: comodel.table.clone(),
                filter: Box::new(inner),
            }),
        },
        _ => {
            return Err(OrmError::internal(format!(
                "field '{}' has no resolved relation",
                field.name
            )));
        }
    })
}

fn id_values(ids: impl IntoIterator<Item = RecordId>) -> Vec<Value> {
    ids.into_iter().map(Value::Id).collect()
}

fn id_leaf(env: &Env, model: &Model, op: Operator, value: &JsonValue) -> OrmResult<Filter> {
    let col = Col::new("id");
    match op {
        Operator::ChildOf | Operator::ParentOf => {
            let ids = resolve_ids(env, model, value)?;
            let all = hierarchy(env, model, &ids, op)?;
            Ok(Filter::In {
                col,
                values: id_values(all),
            })
        }
        Operator::In | Operator::NotIn => {
            let ids = as_id_list(value)?;
            let positive = Filter::In {
                col,
                values: id_values(ids),
            };
            Ok(if op == Operator::In { positive } else { Filter::not(positive) })
        }
        Operator::Eq | Operator::Ne if is_false(value) => Ok(if op == Operator::Eq {
            Filter::False
        } else {
            Filter::True
        }),
        Operator::Eq | Operator::Ne | Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            let id = value
                .as_i64()
                .ok_or_else(|| OrmError::validation(format!("invalid id {value}")))?;
            Ok(Filter::Cmp {
                col,
                op: cmp_op(op),
                value: Value::Id(id),
            })
        }
        _ => Err(OrmError::validation(format!("operator '{op}' is not supported on 'id'"))),
    }
}

fn many2one_leaf(env: &Env, model: &Model, field: &Field, op: Operator, value: &JsonValue) -> OrmResult<Filter> {
    let comodel = comodel_of(env, model, field)?;
    let col = Col::new(&field.name);
    match op {
        Operator::Any | Operator::NotAny => {
            let sub = Domain::from_json(value)?;
            let positive = relational_any(env, field, &comodel, &sub)?;
            Ok(if op == Operator::Any { positive } else { Filter::not(positive) })
        }
        Operator::ChildOf | Operator::ParentOf => {
            let ids = resolve_ids(env, &comodel, value)?;
            let all = hierarchy(env, &comodel, &ids, op)?;
            Ok(Filter::In {
                col,
                values: id_values(all),
            })
        }
        _ if is_textual(value) => {
            let ids = name_search_ids(env, &comodel, op, value)?;
            let positive = Filter::In {
                col,
                values: id_values(ids),
            };
            Ok(if op.is_negative() { Filter::not(positive) } else { positive })
        }
        _ => scalar_leaf(env, model, field, op, value),
    }
}

fn x2many_leaf(env: &Env, model: &Model, field: &Field, op: Operator, value: &JsonValue) -> OrmResult<Filter> {
    let comodel = comodel_of(env, model, field)?;
    let ids: Vec<RecordId> = match op {
        Operator::Any | Operator::NotAny => {
            let sub = Domain::from_json(value)?;
            let positive = relational_any(env, field, &comodel, &sub)?;
            return Ok(if op == Operator::Any { positive } else { Filter::not(positive) });
        }
        Operator::Eq | Operator::Ne if is_false(value) => {
            let any = reaching(field, &comodel, Filter::True)?;
            return Ok(if op == Operator::Eq { Filter::not(any) } else { any });
        }
        Operator::ChildOf | Operator::ParentOf => {
            let ids = resolve_ids(env, &comodel, value)?;
            hierarchy(env, &comodel, &ids, op)?
        }
        _ if is_textual(value) => name_search_ids(env, &comodel, op, value)?,
        Operator::Eq | Operator::Ne | Operator::In | Operator::NotIn => as_id_list(value)?,
        _ => {
            return Err(OrmError::validation(format!(
                "operator '{op}' is not supported on '{}.{}'",
                model.name, field.name
            )));
        }
    };
    let positive = reaching(
        field,
        &comodel,
        Filter::In {
            col: Col::new("id"),
            values: id_values(ids),
        },
    )?;
    Ok(if op.is_negative() { Filter::not(positive) } else { positive })
}

fn scalar_leaf(env: &Env, model: &Model, field: &Field, op: Operator, value: &JsonValue) -> OrmResult<Filter> {
    let col = if field.is_translated() {
        Col::translated(&field.name, env.lang())
    } else {
        Col::new(&field.name)
    };
    let is_bool = matches!(field.ty, FieldType::Boolean);
    let falsy = |col: Col| {
        if is_bool {
            Filter::or(vec![
                Filter::IsNull(col.clone()),
                Filter::Cmp {
                    col,
                    op: CmpOp::Eq,
                    value: Value::Bool(false),
                },
            ])
        } else {
            Filter::IsNull(col)
        }
    };

    match op {
        Operator::Eq | Operator::Ne => {
            let v = domain_value(field, value)?;
            let positive = if v.is_null() || (is_bool && !v.is_truthy()) {
                falsy(col)
            } else {
                Filter::Cmp {
                    col,
                    op: CmpOp::Eq,
                    value: v,
                }
            };
            Ok(if op == Operator::Eq { positive } else { Filter::not(positive) })
        }
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            let v = domain_value(field, value)?;
            if v.is_null() {
                return Ok(Filter::False);
            }
            Ok(Filter::Cmp {
                col,
                op: cmp_op(op),
                value: v,
            })
        }
        Operator::In | Operator::NotIn => {
            let items: Vec<JsonValue> = match value {
                JsonValue::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut values = Vec::new();
            let mut with_false = false;
            for item in &items {
                let v = domain_value(field, item)?;
                if v.is_null() || (is_bool && !v.is_truthy()) {
                    with_false = true;
                } else {
                    values.push(v);
                }
            }
            let mut alternatives = vec![Filter::In {
                col: col.clone(),
                values,
            }];
            if with_false {
                alternatives.push(falsy(col));
            }
            let positive = Filter::or(alternatives);
            Ok(if op == Operator::In { positive } else { Filter::not(positive) })
        }
        Operator::Like
        | Operator::NotLike
        | Operator::ILike
        | Operator::NotILike
        | Operator::EqLike
        | Operator::EqILike => {
            let text = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Null | JsonValue::Bool(false) => String::new(),
                other => other.to_string(),
            };
            let pattern = match op {
                Operator::EqLike | Operator::EqILike => text,
                _ => format!("%{text}%"),
            };
            let positive = Filter::Like {
                col,
                pattern,
                case_insensitive: matches!(op, Operator::ILike | Operator::NotILike | Operator::EqILike),
            };
            Ok(if op.is_negative() { Filter::not(positive) } else { positive })
        }
        Operator::ChildOf | Operator::ParentOf | Operator::Any | Operator::NotAny => {
            Err(OrmError::validation(format!(
                "operator '{op}' needs a relational field, '{}.{}' is {}",
                model.name,
                field.name,
                field.ty.name()
            )))
        }
    }
}

fn cmp_op(op: Operator) -> CmpOp {
    match op {
        Operator::Ne => CmpOp::Ne,
        Operator::Lt => CmpOp::Lt,
        Operator::Le => CmpOp::Le,
        Operator::Gt => CmpOp::Gt,
        Operator::Ge => CmpOp::Ge,
        _ => CmpOp::Eq,
    }
}

fn is_false(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Null | JsonValue::Bool(false))
}

/// String, or non-empty list of strings: compared against record names.
fn is_textual(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(_) => true,
        JsonValue::Array(items) => !items.is_empty() && items.iter().all(JsonValue::is_string),
        _ => false,
    }
}

fn as_id_list(value: &JsonValue) -> OrmResult<Vec<RecordId>> {
    let items = match value {
        JsonValue::Array(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    items
        .iter()
        .filter(|v| !is_false(v))
        .map(|v| {
            v.as_i64()
                .or_else(|| v.as_array().and_then(|pair| pair.first()).and_then(JsonValue::as_i64))
                .ok_or_else(|| OrmError::validation(format!("invalid id {v}")))
        })
        .collect()
}

/// Comparison value of a domain leaf for a scalar field.
fn domain_value(field: &Field, value: &JsonValue) -> OrmResult<Value> {
    match (&field.ty, value) {
        (_, JsonValue::Null) => Ok(Value::Null),
        (
            FieldType::Char { .. } | FieldType::Text | FieldType::Html | FieldType::Selection(_),
            JsonValue::Bool(false),
        ) => Ok(Value::Null),
        (FieldType::Char { .. } | FieldType::Text | FieldType::Html | FieldType::Selection(_), v) => {
            Ok(Value::Text(match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            }))
        }
        _ => field.convert_to_cache(value),
    }
}

/// Target ids whose record name matches `value` under the positive form of `op`.
fn name_search_ids(env: &Env, comodel: &Model, op: Operator, value: &JsonValue) -> OrmResult<Vec<RecordId>> {
    let rec_name = comodel.rec_name.as_deref().ok_or_else(|| {
        OrmError::validation(format!("model '{}' has no name field to search on", comodel.name))
    })?;
    let positive = if op.is_negative() { op.negate().unwrap_or(op) } else { op };
    search_ids(env, comodel, &Domain::leaf(rec_name, positive, value.clone()))
}

fn resolve_ids(env: &Env, model: &Model, value: &JsonValue) -> OrmResult<Vec<RecordId>> {
    if is_textual(value) {
        name_search_ids(env, model, Operator::ILike, value)
    } else {
        as_id_list(value)
    }
}

/// Expand `ids` to their descendants (`child_of`) or ancestors (`parent_of`).
fn hierarchy(env: &Env, model: &Model, ids: &[RecordId], op: Operator) -> OrmResult<Vec<RecordId>> {
    let parent = model.parent_name.as_deref().ok_or_else(|| {
        OrmError::validation(format!(
            "'{}' has no parent field for operator '{op}'",
            model.name
        ))
    })?;
    let mut all: BTreeSet<RecordId> = ids.iter().copied().collect();
    let mut frontier: Vec<RecordId> = ids.to_vec();
    while !frontier.is_empty() {
        let next: Vec<RecordId> = if op == Operator::ChildOf {
            let filter = Filter::In {
                col: Col::new(parent),
                values: id_values(frontier.iter().copied()),
            };
            env.with_cursor(|cr| cr.select_ids(&model.table, &filter, &[], 0, None))?
        } else {
            let mut parents = Vec::new();
            for id in &frontier {
                if let Some(row) = env.with_cursor(|cr| cr.get(&model.table, *id))? {
                    parents.extend(row.get(parent).as_id());
                }
            }
            parents
        };
        frontier = next.into_iter().filter(|id| all.insert(*id)).collect();
    }
    Ok(all.into_iter().collect())
}
