//! Scheduling and draining of stored computed fields.

use strata_core::{OrmError, OrmResult, RecordId, Value};
use strata_infra::store::Values;
use tracing::{trace, warn};

use crate::commands::Command;
use crate::compiler;
use crate::domain::{Domain, Operator};
use crate::env::Env;
use crate::field::{Field, FieldType, round_to};
use crate::model::Model;

/// Recomputations one flush may perform before giving up.
const MAX_STEPS: usize = 1_000_000;

/// Schedule the stored computed fields depending on `fields` of `ids`.
///
/// Called before a change (to reach the records related through the old
/// values) and after it (the new ones).
pub(crate) fn modified(env: &Env, model: &Model, fields: &[String], ids: &[RecordId]) -> OrmResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let registry = env.registry().clone();
    for name in fields {
        for trigger in registry.triggers(&model.name, name) {
            let affected = if trigger.path.is_empty() {
                ids.to_vec()
            } else {
                let target = registry.get(&trigger.model)?;
                let domain = Domain::leaf(trigger.path.join("."), Operator::In, ids.to_vec());
                compiler::search_ids(env, target, &domain)?
            };
            if affected.is_empty() {
                continue;
            }
            trace!(model = %trigger.model, field = %trigger.field, ?affected, "scheduled");
            let rank = registry.rank(&trigger.model, &trigger.field);
            env.with_queue(|q| q.push(rank, &trigger.model, &trigger.field, &affected));
        }
    }
    Ok(())
}

/// [`modified`] for every field of the model.
pub(crate) fn modified_all(env: &Env, model: &Model, ids: &[RecordId]) -> OrmResult<()> {
    let names: Vec<String> = model.fields.keys().cloned().collect();
    modified(env, model, &names, ids)
}

/// Recompute everything pending, lowest rank first.
pub(crate) fn drain(env: &Env) -> OrmResult<()> {
    let sudo = env.sudo();
    let mut steps = 0usize;
    while let Some((model_name, field_name, id)) = env.with_queue(|q| q.pop()) {
        steps += 1;
        if steps > MAX_STEPS {
            return Err(OrmError::internal("recomputation does not converge"));
        }
        let model = env.get_model(&model_name)?;
        if !env.with_cursor(|cr| cr.exists(&model.table, id))? {
            continue;
        }
        let field = model.field(&field_name)?;
        let record = sudo.browse(&model_name, [id])?;
        let value = match (&field.compute, &field.related) {
            (Some(compute), _) => compute(&record)?,
            (None, Some(path)) => record.related_value(id, field, path)?,
            (None, None) => continue,
        };
        let value = coerce(field, value);
        store(&record, &model, field, id, value)?;
    }
    Ok(())
}

fn coerce(field: &Field, value: Value) -> Value {
    match (&field.ty, value) {
        (FieldType::Float { digits }, Value::Float(f)) => Value::Float(round_to(f, *digits)),
        (FieldType::Float { digits }, Value::Int(i)) => Value::Float(round_to(i as f64, *digits)),
        (FieldType::Monetary, Value::Float(f)) => Value::Float(round_to(f, Some(2))),
        (FieldType::Monetary, Value::Int(i)) => Value::Float(i as f64),
        (FieldType::Many2one { .. }, Value::Int(i)) => Value::Id(i),
        (FieldType::Many2one { .. }, Value::Ids(ids)) => ids.first().map(|id| Value::Id(*id)).unwrap_or_default(),
        (FieldType::Boolean, Value::Null) => Value::Bool(false),
        (_, v) => v,
    }
}

/// Store a recomputed value; unchanged values do not cascade.
fn store(record: &crate::RecordSet, model: &Model, field: &Field, id: RecordId, value: Value) -> OrmResult<()> {
    let env = record.env();
    let current = record.raw_value(id, field)?;
    if field.is_x2many() {
        let mut wanted = value.as_ids();
        let mut existing = current.as_ids();
        wanted.sort_unstable();
        existing.sort_unstable();
        if wanted != existing {
            record.apply_commands(field, vec![Command::Set(wanted)])?;
            modified(env, model, &[field.name.clone()], &[id])?;
        }
        return Ok(());
    }
    if !field.has_column() {
        warn!(model = %model.name, field = %field.name, "computed field scheduled but not stored");
        return Ok(());
    }
    let written = field.convert_to_write(value, Some(&current), env.lang());
    if written == current {
        return Ok(());
    }
    let mut row = Values::new();
    row.insert(field.name.clone(), written.clone());
    env.with_cursor(|cr| cr.update(&model.table, id, row))
        .map_err(|e| OrmError::validation(format!("cannot store {}.{}: {e}", model.name, field.name)))?;
    env.with_cache(|c| c.set(&model.name, id, &field.name, written));
    trace!(model = %model.name, field = %field.name, id, "recomputed");
    modified(env, model, &[field.name.clone()], &[id])
}
