//! Recordsets: ordered sets of records of one model bound to an environment.
//!
//! Every model operation (read, search, create, write, unlink, method calls)
//! is a method on [`RecordSet`]. An empty recordset stands for "the model"
//! in operations that do not need records.

mod access;
mod crud;
mod read;
pub(crate) mod recompute;
mod rpc;
mod search;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_core::{OrmError, OrmResult, RecordId, Value};

use crate::domain::{Domain, Operator};
use crate::env::Env;
use crate::model::Model;

pub use rpc::{BUILTIN_METHODS, takes_ids};
pub use search::SearchParams;

#[derive(Clone)]
pub struct RecordSet {
    env: Env,
    model: Arc<Model>,
    ids: Vec<RecordId>,
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.model.name, self.ids)
    }
}

impl PartialEq for RecordSet {
    fn eq(&self, other: &Self) -> bool {
        self.model.name == other.model.name && self.ids == other.ids
    }
}

/// Result of [`RecordSet::mapped`].
#[derive(Debug, Clone)]
pub enum Mapped {
    Values(Vec<Value>),
    Records(RecordSet),
}

impl Mapped {
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Mapped::Values(values) => values,
            Mapped::Records(records) => records.ids.into_iter().map(Value::Id).collect(),
        }
    }

    pub fn into_records(self) -> OrmResult<RecordSet> {
        match self {
            Mapped::Records(records) => Ok(records),
            Mapped::Values(_) => Err(OrmError::validation("mapped path does not end on a relation")),
        }
    }
}

impl RecordSet {
    pub(crate) fn new(env: Env, model: Arc<Model>, ids: Vec<RecordId>) -> Self {
        Self { env, model, ids }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.model.name
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Singleton recordsets, in order.
    pub fn iter(&self) -> impl Iterator<Item = RecordSet> + '_ {
        self.ids.iter().map(|id| self.browse([*id]))
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.ids.contains(&id)
    }

    /// Records of the same model and environment.
    pub fn browse(&self, ids: impl IntoIterator<Item = RecordId>) -> RecordSet {
        RecordSet::new(self.env.clone(), Arc::clone(&self.model), ids.into_iter().collect())
    }

    pub fn with_env(&self, env: &Env) -> RecordSet {
        RecordSet::new(env.clone(), Arc::clone(&self.model), self.ids.clone())
    }

    pub fn sudo(&self) -> RecordSet {
        self.with_env(&self.env.sudo())
    }

    pub fn with_user(&self, uid: RecordId) -> RecordSet {
        self.with_env(&self.env.with_user(uid))
    }

    pub fn with_context(&self, overrides: &JsonMap<String, JsonValue>) -> RecordSet {
        self.with_env(&self.env.with_context(overrides))
    }

    pub fn with_context_value(&self, key: &str, value: impl Into<JsonValue>) -> RecordSet {
        self.with_env(&self.env.with_context_value(key, value))
    }

    /// The id of a singleton; a validation error otherwise.
    pub fn ensure_one(&self) -> OrmResult<RecordId> {
        match self.ids.as_slice() {
            [id] => Ok(*id),
            _ => Err(OrmError::validation(format!("expected singleton: {self:?}"))),
        }
    }

    /// Alias of [`RecordSet::ensure_one`].
    pub fn id(&self) -> OrmResult<RecordId> {
        self.ensure_one()
    }

    fn check_same_model(&self, other: &RecordSet) -> OrmResult<()> {
        if self.model.name != other.model.name {
            return Err(OrmError::validation(format!(
                "cannot combine {} and {} records",
                self.model.name, other.model.name
            )));
        }
        Ok(())
    }

    /// Records of both sets, first occurrence order, without duplicates.
    pub fn union(&self, other: &RecordSet) -> OrmResult<RecordSet> {
        self.check_same_model(other)?;
        let mut ids = Vec::with_capacity(self.len() + other.len());
        for id in self.ids.iter().chain(&other.ids) {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        Ok(self.browse(ids))
    }

    /// Both sets one after the other, duplicates kept.
    pub fn concat(&self, other: &RecordSet) -> OrmResult<RecordSet> {
        self.check_same_model(other)?;
        Ok(self.browse(self.ids.iter().chain(&other.ids).copied()))
    }

    pub fn subtract(&self, other: &RecordSet) -> OrmResult<RecordSet> {
        self.check_same_model(other)?;
        Ok(self.browse(self.ids.iter().copied().filter(|id| !other.ids.contains(id))))
    }

    pub fn intersect(&self, other: &RecordSet) -> OrmResult<RecordSet> {
        self.check_same_model(other)?;
        let mut ids = Vec::new();
        for id in &self.ids {
            if other.ids.contains(id) && !ids.contains(id) {
                ids.push(*id);
            }
        }
        Ok(self.browse(ids))
    }

    /// Records for which `pred` holds, order kept.
    pub fn filtered(&self, mut pred: impl FnMut(&RecordSet) -> OrmResult<bool>) -> OrmResult<RecordSet> {
        let mut ids = Vec::new();
        for record in self.iter() {
            if pred(&record)? {
                ids.push(record.ids[0]);
            }
        }
        Ok(self.browse(ids))
    }

    /// Records matching `domain`, order kept. No access rules apply.
    pub fn filtered_domain(&self, domain: &Domain) -> OrmResult<RecordSet> {
        if self.is_empty() {
            return Ok(self.clone());
        }
        let scoped = Domain::and([Domain::leaf("id", Operator::In, self.ids.clone()), domain.clone()]);
        let matching = crate::compiler::search_ids(&self.env, &self.model, &scoped)?;
        Ok(self.browse(self.ids.iter().copied().filter(|id| matching.contains(id))))
    }

    /// Values of a dotted field path, or the union of the records it reaches.
    pub fn mapped(&self, path: &str) -> OrmResult<Mapped> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = self.clone();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let model = Arc::clone(&current.model);
            let field = model.field(segment)?;
            match field.comodel() {
                Some(comodel) => {
                    let mut ids = Vec::new();
                    for id in &current.ids {
                        for target in current.raw_value(*id, field)?.as_ids() {
                            if !ids.contains(&target) {
                                ids.push(target);
                            }
                        }
                    }
                    current = current.env.browse(comodel, ids)?;
                    if last {
                        return Ok(Mapped::Records(current));
                    }
                }
                None if last => {
                    let lang = current.env.lang().to_string();
                    let values = current
                        .ids
                        .iter()
                        .map(|id| Ok(localized(current.raw_value(*id, field)?, &lang)))
                        .collect::<OrmResult<_>>()?;
                    return Ok(Mapped::Values(values));
                }
                None => {
                    return Err(OrmError::validation(format!(
                        "'{segment}' in path '{path}' is not a relational field"
                    )));
                }
            }
        }
        Ok(Mapped::Records(current))
    }

    /// Records sorted by `field` (by the model order when `None`).
    ///
    /// Duplicates are kept; ids without a row go last in their original order.
    pub fn sorted(&self, field: Option<&str>, reverse: bool) -> OrmResult<RecordSet> {
        let mut ids = match field {
            None => {
                let order = search::order_by(&self.model, &self.model.order, self.env.lang())?;
                let filter = strata_infra::store::Filter::ids(&self.ids);
                let ranked = self
                    .env
                    .with_cursor(|cr| cr.select_ids(&self.model.table, &filter, &order, 0, None))?;
                let rank: std::collections::HashMap<RecordId, usize> =
                    ranked.into_iter().enumerate().map(|(i, id)| (id, i)).collect();
                let mut ids = self.ids.clone();
                ids.sort_by_key(|id| rank.get(id).copied().unwrap_or(usize::MAX));
                ids
            }
            Some(name) => {
                let field = self.model.field(name)?;
                let lang = self.env.lang().to_string();
                let mut keyed = Vec::with_capacity(self.len());
                for id in &self.ids {
                    keyed.push((localized(self.raw_value(*id, field)?, &lang), *id));
                }
                keyed.sort_by(|(a, _), (b, _)| a.sort_cmp(b));
                keyed.into_iter().map(|(_, id)| id).collect()
            }
        };
        if reverse {
            ids.reverse();
        }
        Ok(self.browse(ids))
    }

    /// Records sorted with a custom comparison of singletons.
    pub fn sorted_by(&self, mut cmp: impl FnMut(&RecordSet, &RecordSet) -> Ordering) -> RecordSet {
        let mut records: Vec<RecordSet> = self.iter().collect();
        records.sort_by(|a, b| cmp(a, b));
        self.browse(records.into_iter().map(|r| r.ids[0]))
    }
}

/// Translatable values read in `lang`; other values unchanged.
pub(crate) fn localized(value: Value, lang: &str) -> Value {
    match value {
        Value::Translated(_) => value
            .translation(lang)
            .map(|s| Value::Text(s.to_string()))
            .unwrap_or_default(),
        other => other,
    }
}
