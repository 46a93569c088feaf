//! Environments: one transaction seen by one user under one context.
//!
//! All environments derived from each other share the [`Transaction`]:
//! the cursor, the record cache and the recomputation queue. An environment
//! lives for one call on one thread.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_core::context::{ALLOWED_COMPANY_IDS, LANG};
use strata_core::{Context, OrmError, OrmResult, RecordId, SUPERUSER_ID, Value, XmlId};
use strata_infra::store::{Cursor, Filter};
use tracing::debug;

use crate::model::Model;
use crate::recordset::RecordSet;
use crate::registry::Registry;

/// Model mapping external identifiers to records.
pub const MODEL_DATA: &str = "ir.model.data";

/// Per-record values of stored fields read from or written to the cursor.
#[derive(Debug, Default, Clone)]
pub(crate) struct Cache {
    rows: HashMap<(String, RecordId), HashMap<String, Value>>,
}

impl Cache {
    pub(crate) fn get(&self, model: &str, id: RecordId, field: &str) -> Option<&Value> {
        self.rows
            .get(&(model.to_string(), id))
            .and_then(|row| row.get(field))
    }

    pub(crate) fn contains(&self, model: &str, id: RecordId) -> bool {
        self.rows.contains_key(&(model.to_string(), id))
    }

    pub(crate) fn insert_row(&mut self, model: &str, id: RecordId, values: HashMap<String, Value>) {
        self.rows.insert((model.to_string(), id), values);
    }

    pub(crate) fn set(&mut self, model: &str, id: RecordId, field: &str, value: Value) {
        if let Some(row) = self.rows.get_mut(&(model.to_string(), id)) {
            row.insert(field.to_string(), value);
        }
    }

    pub(crate) fn invalidate(&mut self, model: &str, ids: Option<&[RecordId]>) {
        match ids {
            Some(ids) => {
                for id in ids {
                    self.rows.remove(&(model.to_string(), *id));
                }
            }
            None => self.rows.retain(|(m, _), _| m != model),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Pending recomputations, drained by field rank, then model, then record id.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecomputeQueue {
    pending: BTreeSet<(usize, String, RecordId, String)>,
}

impl RecomputeQueue {
    pub(crate) fn push(&mut self, rank: usize, model: &str, field: &str, ids: &[RecordId]) {
        for id in ids {
            self.pending
                .insert((rank, model.to_string(), *id, field.to_string()));
        }
    }

    pub(crate) fn pop(&mut self) -> Option<(String, String, RecordId)> {
        self.pending
            .pop_first()
            .map(|(_, model, id, field)| (model, field, id))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// State shared by every environment of one transaction.
pub struct Transaction {
    registry: Arc<Registry>,
    cursor: RefCell<Cursor>,
    cache: RefCell<Cache>,
    todo: RefCell<RecomputeQueue>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("registry", &self.registry)
            .field("pending", &self.todo.borrow().len())
            .finish()
    }
}

#[derive(Clone)]
pub struct Env {
    tx: Rc<Transaction>,
    uid: RecordId,
    su: bool,
    context: Context,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("uid", &self.uid)
            .field("su", &self.su)
            .field("context", &self.context)
            .finish()
    }
}

impl Env {
    pub fn new(registry: Arc<Registry>, cursor: Cursor, uid: RecordId, context: Context) -> Self {
        Self {
            tx: Rc::new(Transaction {
                registry,
                cursor: RefCell::new(cursor),
                cache: RefCell::new(Cache::default()),
                todo: RefCell::new(RecomputeQueue::default()),
            }),
            uid,
            su: false,
            context,
        }
    }

    /// Superuser environment with an empty context.
    pub fn superuser(registry: Arc<Registry>, cursor: Cursor) -> Self {
        Self::new(registry, cursor, SUPERUSER_ID, Context::new())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.tx.registry
    }

    pub fn uid(&self) -> RecordId {
        self.uid
    }

    /// Whether access checks are bypassed.
    pub fn is_superuser(&self) -> bool {
        self.su || self.uid == SUPERUSER_ID
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn lang(&self) -> &str {
        self.context.lang()
    }

    /// Active company: the first allowed company of the context.
    pub fn company_id(&self) -> Option<RecordId> {
        self.context.company_ids().first().copied()
    }

    /// Same transaction as user `uid`, without superuser mode.
    pub fn with_user(&self, uid: RecordId) -> Env {
        Env {
            tx: Rc::clone(&self.tx),
            uid,
            su: false,
            context: self.context.clone(),
        }
    }

    pub fn with_context(&self, overrides: &JsonMap<String, JsonValue>) -> Env {
        Env {
            context: self.context.with_all(overrides),
            ..self.clone()
        }
    }

    pub fn with_context_value(&self, key: &str, value: impl Into<JsonValue>) -> Env {
        Env {
            context: self.context.with(key, value),
            ..self.clone()
        }
    }

    pub fn with_lang(&self, lang: &str) -> Env {
        self.with_context_value(LANG, lang)
    }

    /// Make `company` the active company, keeping the other allowed ones after it.
    pub fn with_company(&self, company: RecordId) -> Env {
        let mut ids = vec![company];
        ids.extend(self.context.company_ids().into_iter().filter(|c| *c != company));
        self.with_context_value(ALLOWED_COMPANY_IDS, ids)
    }

    pub fn sudo(&self) -> Env {
        Env {
            su: true,
            ..self.clone()
        }
    }

    pub fn with_su(&self, su: bool) -> Env {
        Env { su, ..self.clone() }
    }

    /// Whether both environments share one transaction.
    pub fn same_transaction(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.tx, &other.tx)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Models and records
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_model(&self, name: &str) -> OrmResult<Arc<Model>> {
        self.tx.registry.get(name).cloned()
    }

    /// Empty recordset of `name`.
    pub fn model(&self, name: &str) -> OrmResult<RecordSet> {
        Ok(RecordSet::new(self.clone(), self.get_model(name)?, Vec::new()))
    }

    pub fn browse(&self, name: &str, ids: impl IntoIterator<Item = RecordId>) -> OrmResult<RecordSet> {
        Ok(RecordSet::new(
            self.clone(),
            self.get_model(name)?,
            ids.into_iter().collect(),
        ))
    }

    /// The current user, when a users model is installed.
    pub fn user(&self) -> OrmResult<RecordSet> {
        self.browse(crate::registry::USERS_MODEL, [self.uid])
    }

    /// Resolve an external identifier to `(model, id)`.
    pub fn ref_id(&self, xmlid: &str) -> OrmResult<(String, RecordId)> {
        self.lookup_xmlid(xmlid)?
            .ok_or_else(|| OrmError::missing(format!("external id '{xmlid}' not found")))
    }

    /// Resolve an external identifier, `None` when unknown.
    pub fn lookup_xmlid(&self, xmlid: &str) -> OrmResult<Option<(String, RecordId)>> {
        let xid: XmlId = xmlid.parse()?;
        let data = self.get_model(MODEL_DATA)?;
        let filter = Filter::and(vec![
            Filter::eq("module", xid.module.as_str()),
            Filter::eq("name", xid.name.as_str()),
        ]);
        let rows = self.with_cursor(|cr| cr.select(&data.table, &filter, &[], 0, Some(1)))?;
        Ok(rows.first().and_then(|row| {
            let model = row.get("model").as_str().map(str::to_string)?;
            let id = row.get("res_id").as_int()?;
            Some((model, id))
        }))
    }

    /// Record with the given external identifier.
    pub fn ref_record(&self, xmlid: &str) -> OrmResult<RecordSet> {
        let (model, id) = self.ref_id(xmlid)?;
        let records = self.browse(&model, [id])?;
        if records.exists()?.is_empty() {
            return Err(OrmError::missing(format!(
                "external id '{xmlid}' points to deleted record {model}({id})"
            )));
        }
        Ok(records)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transaction
    // ─────────────────────────────────────────────────────────────────────

    /// Run `f` with the transaction cursor.
    ///
    /// The cursor is borrowed for the duration of `f` only; `f` must not call
    /// back into recordsets.
    pub fn with_cursor<R>(&self, f: impl FnOnce(&mut Cursor) -> R) -> R {
        let mut cursor = self.tx.cursor.borrow_mut();
        f(&mut cursor)
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut Cache) -> R) -> R {
        let mut cache = self.tx.cache.borrow_mut();
        f(&mut cache)
    }

    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(&mut RecomputeQueue) -> R) -> R {
        let mut queue = self.tx.todo.borrow_mut();
        f(&mut queue)
    }

    /// Drain pending recomputations to the cursor.
    pub fn flush(&self) -> OrmResult<()> {
        crate::recordset::recompute::drain(self)
    }

    /// Drop every cached value.
    pub fn clear(&self) {
        self.with_cache(Cache::clear);
    }

    /// Drop cached values of `model` (all records when `ids` is `None`).
    pub fn invalidate(&self, model: &str, ids: Option<&[RecordId]>) {
        self.with_cache(|c| c.invalidate(model, ids));
    }

    /// Run `f` inside a savepoint: on error the cursor, cache and pending
    /// recomputations are restored to their state before `f`.
    pub fn savepoint<T>(&self, f: impl FnOnce() -> OrmResult<T>) -> OrmResult<T> {
        let sp = self.with_cursor(|cr| cr.savepoint());
        let queue = self.with_queue(|q| q.clone());
        match f() {
            Ok(value) => {
                self.with_cursor(|cr| cr.release(sp));
                Ok(value)
            }
            Err(err) => {
                self.with_cursor(|cr| cr.rollback_to(sp));
                self.clear();
                self.with_queue(|q| *q = queue);
                debug!(error = %err, "rolled back to savepoint");
                Err(err)
            }
        }
    }

    /// Flush and commit; the transaction continues on a fresh cursor.
    pub fn commit(&self) -> OrmResult<()> {
        self.flush()?;
        let mut cursor = self.tx.cursor.borrow_mut();
        let mut fresh = cursor.database().cursor();
        fresh.set_deadline(cursor.deadline());
        let done = std::mem::replace(&mut *cursor, fresh);
        drop(cursor);
        done.commit()?;
        Ok(())
    }

    /// Discard the transaction's changes; the transaction continues on a fresh cursor.
    pub fn rollback(&self) {
        {
            let mut cursor = self.tx.cursor.borrow_mut();
            let mut fresh = cursor.database().cursor();
            fresh.set_deadline(cursor.deadline());
            std::mem::replace(&mut *cursor, fresh).rollback();
        }
        self.clear();
        self.with_queue(|q| *q = RecomputeQueue::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_by_rank_then_model_then_id() {
        let mut q = RecomputeQueue::default();
        q.push(1, "a", "total", &[3]);
        q.push(0, "b", "subtotal", &[9, 2]);
        q.push(0, "a", "x", &[5]);
        let order: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), "x".to_string(), 5),
                ("b".to_string(), "subtotal".to_string(), 2),
                ("b".to_string(), "subtotal".to_string(), 9),
                ("a".to_string(), "total".to_string(), 3),
            ]
        );
    }

    #[test]
    fn cache_invalidation_is_per_model() {
        let mut c = Cache::default();
        c.insert_row("a", 1, HashMap::from([("x".to_string(), Value::Int(1))]));
        c.insert_row("b", 1, HashMap::new());
        c.set("a", 1, "x", Value::Int(2));
        assert_eq!(c.get("a", 1, "x"), Some(&Value::Int(2)));
        c.invalidate("a", None);
        assert!(!c.contains("a", 1));
        assert!(c.contains("b", 1));
    }
}
