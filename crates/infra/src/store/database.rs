//! Databases and transactional cursors.
//!
//! A [`Cursor`] works on a private snapshot of the committed tables; tables
//! are copied on first write. Commit re-validates every written row against
//! the committed row versions, so the first committer wins and a late writer
//! gets [`StoreError::SerializationConflict`].

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use strata_core::{RecordId, Value};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};
use super::filter::{Filter, OrderBy, compare_rows, matches};
use super::schema::{ColumnType, OnDelete, SchemaChange, TableDef};
use super::snapshot::{DatabaseState, SnapshotStore};
use super::table::{Row, Table};

/// Column values of one row, without the `id`.
pub type Values = BTreeMap<String, Value>;

struct Committed {
    commit_seq: u64,
    tables: BTreeMap<String, Arc<Table>>,
}

struct Inner {
    name: String,
    committed: Mutex<Committed>,
    sequences: Mutex<BTreeMap<String, RecordId>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

/// A named database. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("persistent", &self.inner.snapshots.is_some())
            .finish()
    }
}

impl Database {
    /// A database living only in memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::from_state(name.into(), DatabaseState::default(), None)
    }

    /// Open (or create) a database persisted through `snapshots`.
    pub fn open(name: impl Into<String>, snapshots: Arc<dyn SnapshotStore>) -> StoreResult<Self> {
        let name = name.into();
        let state = snapshots.load(&name)?.unwrap_or_default();
        debug!(db = %name, tables = state.tables.len(), "database opened");
        Ok(Self::from_state(name, state, Some(snapshots)))
    }

    fn from_state(
        name: String,
        state: DatabaseState,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let mut sequences = state.sequences;
        for (table_name, table) in &state.tables {
            let max = table.rows.keys().next_back().copied().unwrap_or(0);
            let seq = sequences.entry(table_name.clone()).or_insert(0);
            *seq = (*seq).max(max);
        }
        let tables = state
            .tables
            .into_iter()
            .map(|(name, table)| (name, Arc::new(table)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                name,
                committed: Mutex::new(Committed {
                    commit_seq: state.commit_seq,
                    tables,
                }),
                sequences: Mutex::new(sequences),
                snapshots,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Begin a transaction.
    pub fn cursor(&self) -> Cursor {
        let tables = self
            .inner
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tables
            .clone();
        Cursor {
            db: self.clone(),
            tables,
            writes: BTreeMap::new(),
            ddl: BTreeMap::new(),
            savepoints: Vec::new(),
            deadline: None,
            aborted: Cell::new(false),
            finished: false,
        }
    }

    /// Begin a transaction that aborts once `deadline` passes.
    pub fn cursor_with_deadline(&self, deadline: Instant) -> Cursor {
        let mut cursor = self.cursor();
        cursor.deadline = Some(deadline);
        cursor
    }

    /// Copy of the committed state.
    pub fn state(&self) -> DatabaseState {
        let committed = self
            .inner
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.export(&committed)
    }

    fn export(&self, committed: &Committed) -> DatabaseState {
        DatabaseState {
            commit_seq: committed.commit_seq,
            tables: committed
                .tables
                .iter()
                .map(|(name, table)| (name.clone(), (**table).clone()))
                .collect(),
            sequences: self
                .inner
                .sequences
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn next_id(&self, table: &str) -> RecordId {
        let mut sequences = self
            .inner
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }
}

/// Saved cursor state for nested rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

#[derive(Clone)]
struct SavedState {
    tables: BTreeMap<String, Arc<Table>>,
    writes: BTreeMap<(String, RecordId), Option<u64>>,
    ddl: BTreeMap<String, Option<u64>>,
}

/// One transaction over a [`Database`].
///
/// Dropping a cursor without committing rolls it back.
pub struct Cursor {
    db: Database,
    tables: BTreeMap<String, Arc<Table>>,
    /// Rows written by this transaction with the committed version they were read at
    /// (`None` for rows this transaction inserted).
    writes: BTreeMap<(String, RecordId), Option<u64>>,
    /// Tables whose definition changed, with the definition version they were read at.
    ddl: BTreeMap<String, Option<u64>>,
    savepoints: Vec<SavedState>,
    deadline: Option<Instant>,
    aborted: Cell<bool>,
    finished: bool,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.db.name())
            .field("writes", &self.writes.len())
            .field("aborted", &self.aborted.get())
            .finish()
    }
}

impl Cursor {
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this transaction changed anything yet.
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty() || !self.ddl.is_empty()
    }

    fn check(&self) -> StoreResult<()> {
        if self.aborted.get() {
            return Err(StoreError::Aborted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.aborted.set(true);
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut Table> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Schema
    // ─────────────────────────────────────────────────────────────────────

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_def(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name).map(|t| &t.def)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Changes needed for the table to match `desired`.
    pub fn plan_schema(&self, desired: &TableDef) -> Vec<SchemaChange> {
        desired.plan_from(self.table_def(&desired.name))
    }

    /// Plan and apply the changes making the table match `desired`.
    pub fn reconcile(&mut self, desired: &TableDef) -> StoreResult<Vec<SchemaChange>> {
        let plan = self.plan_schema(desired);
        for change in &plan {
            debug!(sql = %change.to_sql(), "schema change");
            self.apply_schema(change)?;
        }
        Ok(plan)
    }

    fn touch_def(&mut self, table: &str) {
        let base = self.tables.get(table).map(|t| t.def_version);
        self.ddl.entry(table.to_string()).or_insert(base);
    }

    pub fn apply_schema(&mut self, change: &SchemaChange) -> StoreResult<()> {
        self.check()?;
        let table_name = change.table().to_string();
        match change {
            SchemaChange::CreateTable(def) => {
                if self.has_table(&def.name) {
                    return Err(StoreError::Schema(format!("table '{}' already exists", def.name)));
                }
                self.touch_def(&def.name);
                self.tables
                    .insert(def.name.clone(), Arc::new(Table::new(def.clone())));
            }
            SchemaChange::AddColumn { column, .. } => {
                self.touch_def(&table_name);
                let table = self.table_mut(&table_name)?;
                if table.def.has_column(&column.name) {
                    return Err(StoreError::Schema(format!(
                        "column {table_name}.{} already exists",
                        column.name
                    )));
                }
                table.def.columns.insert(column.name.clone(), column.clone());
            }
            SchemaChange::AlterColumnType { column, to, .. } => {
                self.alter_column_type(&table_name, column, to)?;
            }
            SchemaChange::SetNotNull { column, .. } => {
                let table = self.table(&table_name)?;
                if table.rows.values().any(|r| r.get(column).is_null()) {
                    warn!(table = %table_name, column = %column, "existing nulls, NOT NULL not enforced");
                    return Ok(());
                }
                self.touch_def(&table_name);
                self.column_mut(&table_name, column)?.not_null = true;
            }
            SchemaChange::DropNotNull { column, .. } => {
                self.touch_def(&table_name);
                self.column_mut(&table_name, column)?.not_null = false;
            }
            SchemaChange::CreateIndex { column, .. } => {
                self.touch_def(&table_name);
                self.column_mut(&table_name, column)?.index = true;
            }
            SchemaChange::AddUnique { constraint, .. } => {
                let table = self.table(&table_name)?;
                let mut seen = BTreeSet::new();
                for row in table.rows.values() {
                    let key: Vec<Value> = constraint.columns.iter().map(|c| row.get(c)).collect();
                    if key.iter().any(Value::is_null) {
                        continue;
                    }
                    if !seen.insert(format!("{key:?}")) {
                        warn!(table = %table_name, constraint = %constraint.name, "duplicate rows, constraint not added");
                        return Ok(());
                    }
                }
                self.touch_def(&table_name);
                self.table_mut(&table_name)?.def.uniques.push(constraint.clone());
            }
            SchemaChange::AddForeignKey {
                column,
                foreign_key,
                ..
            } => {
                let target = self.table(&foreign_key.table)?;
                let dangling = self
                    .table(&table_name)?
                    .rows
                    .values()
                    .filter_map(|r| r.get(column).as_id())
                    .any(|id| target.row(id).is_none());
                if dangling {
                    warn!(table = %table_name, column = %column, "dangling references, foreign key not added");
                    return Ok(());
                }
                self.touch_def(&table_name);
                let col = self.column_mut(&table_name, column)?;
                col.ty = ColumnType::Ref;
                col.foreign_key = Some(foreign_key.clone());
            }
        }
        Ok(())
    }

    fn column_mut(&mut self, table: &str, column: &str) -> StoreResult<&mut super::schema::ColumnDef> {
        let t = self.table_mut(table)?;
        t.def
            .columns
            .get_mut(column)
            .ok_or_else(|| StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    fn alter_column_type(&mut self, table_name: &str, column: &str, to: &ColumnType) -> StoreResult<()> {
        let table = self.table(table_name)?;
        let from = table
            .def
            .columns
            .get(column)
            .map(|c| c.ty.clone())
            .ok_or_else(|| StoreError::UnknownColumn {
                table: table_name.to_string(),
                column: column.to_string(),
            })?;

        let mut converted = Vec::new();
        for row in table.rows.values() {
            let old = row.get(column);
            let new = convert_cell(&old, &from, to).ok_or_else(|| {
                StoreError::Schema(format!(
                    "cannot convert {table_name}.{column} of row {} from {} to {}",
                    row.id,
                    from.sql_name(),
                    to.sql_name()
                ))
            })?;
            if new != old {
                converted.push((row.id, row.version, new));
            }
        }

        self.touch_def(table_name);
        for (id, version, _) in &converted {
            self.writes
                .entry((table_name.to_string(), *id))
                .or_insert(Some(*version));
        }
        let table = self.table_mut(table_name)?;
        for (id, _, value) in converted {
            if let Some(row) = table.rows.get_mut(&id) {
                row.values.insert(column.to_string(), value);
            }
        }
        if let Some(col) = table.def.columns.get_mut(column) {
            col.ty = to.clone();
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rows
    // ─────────────────────────────────────────────────────────────────────

    pub fn get(&self, table: &str, id: RecordId) -> StoreResult<Option<Row>> {
        self.check()?;
        Ok(self.table(table)?.row(id).cloned())
    }

    pub fn exists(&self, table: &str, id: RecordId) -> StoreResult<bool> {
        self.check()?;
        Ok(self.table(table)?.row(id).is_some())
    }

    /// Rows of `table` satisfying `filter`, ordered, then windowed.
    pub fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: &[OrderBy],
        offset: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Row>> {
        self.check()?;
        let t = self.table(table)?;
        let mut rows = Vec::new();
        for row in t.rows.values() {
            if matches(&self.tables, t, row, filter)? {
                rows.push(row);
            }
        }
        if !order.is_empty() {
            rows.sort_by(|a, b| compare_rows(a, b, order));
        }
        let rows = rows.into_iter().skip(offset);
        Ok(match limit {
            Some(limit) => rows.take(limit).cloned().collect(),
            None => rows.cloned().collect(),
        })
    }

    pub fn select_ids(
        &self,
        table: &str,
        filter: &Filter,
        order: &[OrderBy],
        offset: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<RecordId>> {
        Ok(self
            .select(table, filter, order, offset, limit)?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    pub fn count(&self, table: &str, filter: &Filter) -> StoreResult<usize> {
        self.check()?;
        let t = self.table(table)?;
        let mut n = 0;
        for row in t.rows.values() {
            if matches(&self.tables, t, row, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Insert a row and return its freshly allocated id.
    pub fn insert(&mut self, table: &str, values: Values) -> StoreResult<RecordId> {
        self.check()?;
        let values = self.validate(table, None, values)?;
        let id = self.db.next_id(table);
        let row = Row {
            id,
            version: 0,
            values,
        };
        self.check_row(table, &row)?;
        self.table_mut(table)?.rows.insert(id, row);
        self.writes.insert((table.to_string(), id), None);
        Ok(id)
    }

    /// Update the given columns of an existing row.
    pub fn update(&mut self, table: &str, id: RecordId, values: Values) -> StoreResult<()> {
        self.check()?;
        if values.is_empty() {
            return Ok(());
        }
        let values = self.validate(table, Some(id), values)?;
        let mut row = self
            .table(table)?
            .row(id)
            .cloned()
            .ok_or_else(|| StoreError::MissingRow {
                table: table.to_string(),
                id,
            })?;
        row.values.extend(values);
        self.check_row(table, &row)?;
        self.writes
            .entry((table.to_string(), id))
            .or_insert(Some(row.version));
        self.table_mut(table)?.rows.insert(id, row);
        Ok(())
    }

    /// Delete a row, applying the foreign-key actions of referencing rows.
    ///
    /// On failure nothing is deleted.
    pub fn delete(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        self.check()?;
        let sp = self.savepoint();
        match self.delete_inner(table, id) {
            Ok(()) => {
                self.release(sp);
                Ok(())
            }
            Err(e) => {
                self.rollback_to(sp);
                Err(e)
            }
        }
    }

    fn delete_inner(&mut self, table: &str, id: RecordId) -> StoreResult<()> {
        let Some(row) = self.table_mut(table)?.rows.remove(&id) else {
            return Ok(());
        };
        self.writes
            .entry((table.to_string(), id))
            .or_insert(Some(row.version));

        let mut referencing = Vec::new();
        for (name, t) in &self.tables {
            for col in t.def.references_to(table) {
                let on_delete = col.foreign_key.as_ref().map(|fk| fk.on_delete).unwrap_or_default();
                for r in t.rows.values() {
                    if r.get(&col.name).as_id() == Some(id) {
                        referencing.push((name.clone(), r.id, col.name.clone(), on_delete, col.not_null));
                    }
                }
            }
        }

        for (ref_table, ref_id, column, on_delete, not_null) in referencing {
            match on_delete {
                OnDelete::Restrict => {
                    return Err(StoreError::Restricted {
                        table: table.to_string(),
                        id,
                        referencing_table: ref_table,
                        column,
                    });
                }
                OnDelete::Cascade => self.delete_inner(&ref_table, ref_id)?,
                OnDelete::SetNull => {
                    if not_null {
                        return Err(StoreError::NotNull {
                            table: ref_table,
                            column,
                        });
                    }
                    // The row may already be gone through another cascade path.
                    if self.table(&ref_table)?.row(ref_id).is_some() {
                        let mut values = Values::new();
                        values.insert(column, Value::Null);
                        self.update(&ref_table, ref_id, values)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Check column existence, types and foreign keys of `values`.
    fn validate(&self, table: &str, id: Option<RecordId>, values: Values) -> StoreResult<Values> {
        let t = self.table(table)?;
        let mut out = Values::new();
        for (column, value) in values {
            let Some(def) = t.def.columns.get(&column) else {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column,
                });
            };
            let value = def.ty.coerce(value);
            if !def.ty.accepts(&value) {
                return Err(StoreError::TypeMismatch {
                    table: table.to_string(),
                    column,
                    expected: def.ty.sql_name(),
                    found: value.type_name().to_string(),
                });
            }
            if let (Some(fk), Some(target_id)) = (&def.foreign_key, value.as_id()) {
                let self_ref = fk.table == table && Some(target_id) == id;
                if !self_ref && self.table(&fk.table)?.row(target_id).is_none() {
                    return Err(StoreError::ForeignKeyViolation {
                        table: table.to_string(),
                        column,
                        target: fk.table.clone(),
                        id: target_id,
                    });
                }
            }
            out.insert(column, value);
        }
        Ok(out)
    }

    /// Check NOT NULL and unique constraints of a complete row.
    fn check_row(&self, table: &str, row: &Row) -> StoreResult<()> {
        let t = self.table(table)?;
        for col in t.def.columns.values().filter(|c| c.not_null) {
            if row.get(&col.name).is_null() {
                return Err(StoreError::NotNull {
                    table: table.to_string(),
                    column: col.name.clone(),
                });
            }
        }
        for constraint in &t.def.uniques {
            let key: Vec<Value> = constraint.columns.iter().map(|c| row.get(c)).collect();
            if key.iter().any(Value::is_null) {
                continue;
            }
            let clash = t.rows.values().any(|other| {
                other.id != row.id
                    && constraint
                        .columns
                        .iter()
                        .zip(&key)
                        .all(|(c, v)| other.get(c).loose_eq(v))
            });
            if clash {
                return Err(StoreError::UniqueViolation {
                    table: table.to_string(),
                    constraint: constraint.name.clone(),
                });
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transaction control
    // ─────────────────────────────────────────────────────────────────────

    pub fn savepoint(&mut self) -> Savepoint {
        self.savepoints.push(SavedState {
            tables: self.tables.clone(),
            writes: self.writes.clone(),
            ddl: self.ddl.clone(),
        });
        Savepoint(self.savepoints.len() - 1)
    }

    /// Undo everything done since `sp` was taken. Later savepoints are discarded.
    pub fn rollback_to(&mut self, sp: Savepoint) {
        if sp.0 >= self.savepoints.len() {
            return;
        }
        let saved = self.savepoints[sp.0].clone();
        self.savepoints.truncate(sp.0);
        self.tables = saved.tables;
        self.writes = saved.writes;
        self.ddl = saved.ddl;
    }

    /// Forget `sp` (and later savepoints) keeping the changes.
    pub fn release(&mut self, sp: Savepoint) {
        self.savepoints.truncate(sp.0);
    }

    /// Commit the transaction.
    pub fn commit(mut self) -> StoreResult<()> {
        self.check()?;
        self.finished = true;
        if !self.is_dirty() {
            return Ok(());
        }

        let inner = &self.db.inner;
        let mut committed = inner
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for (table, base) in &self.ddl {
            let current = committed.tables.get(table).map(|t| t.def_version);
            if current != *base {
                return Err(StoreError::SerializationConflict(format!(
                    "definition of table '{table}' changed concurrently"
                )));
            }
        }
        for ((table, id), base) in &self.writes {
            let Some(base) = base else { continue };
            let current = committed
                .tables
                .get(table)
                .and_then(|t| t.row(*id))
                .map(|r| r.version);
            if current != Some(*base) {
                return Err(StoreError::SerializationConflict(format!(
                    "row {id} of '{table}' was modified by a concurrent transaction"
                )));
            }
        }

        let seq = committed.commit_seq + 1;
        let mut tables = committed.tables.clone();
        for table in self.ddl.keys() {
            let Some(mine) = self.tables.get(table) else { continue };
            match tables.get_mut(table) {
                Some(existing) => {
                    let t = Arc::make_mut(existing);
                    t.def = mine.def.clone();
                    t.def_version = seq;
                }
                None => {
                    let mut t = Table::new(mine.def.clone());
                    t.def_version = seq;
                    tables.insert(table.clone(), Arc::new(t));
                }
            }
        }
        for (table, id) in self.writes.keys() {
            let mine = self.tables.get(table).and_then(|t| t.row(*id));
            let Some(target) = tables.get_mut(table) else { continue };
            let target = Arc::make_mut(target);
            match mine {
                Some(row) => {
                    let mut row = row.clone();
                    row.version = seq;
                    target.rows.insert(*id, row);
                }
                None => {
                    target.rows.remove(id);
                }
            }
        }

        check_published(&tables, &self.writes)?;

        let next = Committed {
            commit_seq: seq,
            tables,
        };
        if let Some(snapshots) = &inner.snapshots {
            snapshots.save(&inner.name, &self.db.export(&next))?;
        }
        debug!(
            db = %inner.name,
            commit_seq = seq,
            rows = self.writes.len(),
            tables = self.ddl.len(),
            "transaction committed"
        );
        *committed = next;
        Ok(())
    }

    /// Discard every change of the transaction.
    pub fn rollback(mut self) {
        self.finished = true;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.finished && self.is_dirty() {
            debug!(db = %self.db.name(), "uncommitted transaction rolled back");
        }
    }
}

/// Re-check the rows written by a committing transaction against the state
/// it is about to publish. Concurrent inserts and deletes it never saw may
/// break a unique key or leave a reference dangling.
fn check_published(
    tables: &BTreeMap<String, Arc<Table>>,
    writes: &BTreeMap<(String, RecordId), Option<u64>>,
) -> StoreResult<()> {
    for (table, id) in writes.keys() {
        let Some(t) = tables.get(table) else { continue };
        let Some(row) = t.row(*id) else {
            for (name, other) in tables {
                for col in other.def.references_to(table) {
                    if let Some(r) = other.rows.values().find(|r| r.get(&col.name).as_id() == Some(*id)) {
                        return Err(StoreError::SerializationConflict(format!(
                            "row {} of '{name}' was linked to row {id} of '{table}' by a concurrent transaction",
                            r.id
                        )));
                    }
                }
            }
            continue;
        };
        for col in t.def.columns.values() {
            let (Some(fk), Some(target)) = (&col.foreign_key, row.get(&col.name).as_id()) else {
                continue;
            };
            if !tables.get(&fk.table).is_some_and(|ft| ft.row(target).is_some()) {
                return Err(StoreError::SerializationConflict(format!(
                    "row {target} of '{}' referenced by {table}.{} was deleted by a concurrent transaction",
                    fk.table, col.name
                )));
            }
        }
        for constraint in &t.def.uniques {
            let key: Vec<Value> = constraint.columns.iter().map(|c| row.get(c)).collect();
            if key.iter().any(Value::is_null) {
                continue;
            }
            let clash = t.rows.values().any(|other| {
                other.id != row.id
                    && constraint
                        .columns
                        .iter()
                        .zip(&key)
                        .all(|(c, v)| other.get(c).loose_eq(v))
            });
            if clash {
                return Err(StoreError::SerializationConflict(format!(
                    "constraint '{}' of '{table}' was taken by a concurrent transaction",
                    constraint.name
                )));
            }
        }
    }
    Ok(())
}

fn convert_cell(value: &Value, from: &ColumnType, to: &ColumnType) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    let converted = match (from, to, value) {
        (_, ColumnType::Float, Value::Int(i)) => Value::Float(*i as f64),
        (_, ColumnType::Jsonb, Value::Text(s)) => {
            let mut map = BTreeMap::new();
            map.insert(strata_core::value::DEFAULT_LANG.to_string(), s.clone());
            Value::Translated(map)
        }
        (ColumnType::Jsonb, ColumnType::Varchar(_) | ColumnType::Text, v @ Value::Translated(_)) => {
            Value::Text(v.translation(strata_core::value::DEFAULT_LANG)?.to_string())
        }
        (_, ColumnType::Timestamp, Value::Date(d)) => Value::DateTime(d.and_hms_opt(0, 0, 0)?),
        (_, ColumnType::Integer, Value::Float(f)) => Value::Int(f.round() as i64),
        (_, ColumnType::Integer, Value::Id(i)) => Value::Int(*i),
        (_, ColumnType::Ref, Value::Int(i)) => Value::Id(*i),
        (_, ColumnType::Varchar(_) | ColumnType::Text, Value::Int(i)) => Value::Text(i.to_string()),
        (_, _, v) => v.clone(),
    };
    to.accepts(&converted).then_some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ColumnDef;
    use crate::store::snapshot::InMemorySnapshotStore;

    fn vals(pairs: &[(&str, Value)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn setup() -> Database {
        let db = Database::in_memory("test");
        let mut cr = db.cursor();
        cr.reconcile(
            &TableDef::new("order")
                .column(ColumnDef::new("name", ColumnType::Varchar(None)).not_null())
                .unique("order_name_uniq", &["name"]),
        )
        .unwrap();
        cr.reconcile(
            &TableDef::new("order_line")
                .column(ColumnDef::new("order_id", ColumnType::Ref).references("order", OnDelete::Cascade))
                .column(ColumnDef::new("subtotal", ColumnType::Float)),
        )
        .unwrap();
        cr.reconcile(
            &TableDef::new("invoice")
                .column(ColumnDef::new("order_id", ColumnType::Ref).references("order", OnDelete::Restrict)),
        )
        .unwrap();
        cr.commit().unwrap();
        db
    }

    #[test]
    fn reads_see_own_writes_but_not_others_uncommitted() {
        let db = setup();
        let mut a = db.cursor();
        let id = a.insert("order", vals(&[("name", "SO1".into())])).unwrap();
        assert!(a.exists("order", id).unwrap());

        let b = db.cursor();
        assert!(!b.exists("order", id).unwrap());
        a.commit().unwrap();

        // `b` keeps its snapshot; a new cursor sees the commit.
        assert!(!b.exists("order", id).unwrap());
        assert!(db.cursor().exists("order", id).unwrap());
    }

    #[test]
    fn ids_are_never_reused_after_rollback() {
        let db = setup();
        let mut a = db.cursor();
        let first = a.insert("order", vals(&[("name", "A".into())])).unwrap();
        a.rollback();
        let mut b = db.cursor();
        let second = b.insert("order", vals(&[("name", "A".into())])).unwrap();
        assert!(second > first);
    }

    #[test]
    fn first_committer_wins() {
        let db = setup();
        let mut cr = db.cursor();
        let id = cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        cr.commit().unwrap();

        let mut a = db.cursor();
        let mut b = db.cursor();
        a.update("order", id, vals(&[("name", "B".into())])).unwrap();
        b.update("order", id, vals(&[("name", "C".into())])).unwrap();
        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert!(matches!(err, StoreError::SerializationConflict(_)));

        let row = db.cursor().get("order", id).unwrap().unwrap();
        assert_eq!(row.get("name"), Value::Text("B".into()));
    }

    #[test]
    fn concurrent_inserts_cannot_share_a_unique_key() {
        let db = setup();
        let mut a = db.cursor();
        let mut b = db.cursor();
        a.insert("order", vals(&[("name", "X".into())])).unwrap();
        b.insert("order", vals(&[("name", "X".into())])).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::SerializationConflict(_))));
        assert_eq!(db.cursor().count("order", &Filter::True).unwrap(), 1);
    }

    #[test]
    fn concurrent_delete_and_reference_cannot_both_commit() {
        let db = setup();
        let mut cr = db.cursor();
        let order = cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        cr.commit().unwrap();

        // Child first: the parent delete would orphan it.
        let mut a = db.cursor();
        let mut b = db.cursor();
        let line = a.insert("order_line", vals(&[("order_id", Value::Id(order))])).unwrap();
        b.delete("order", order).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::SerializationConflict(_))));
        assert!(db.cursor().exists("order", order).unwrap());

        // Delete first: the new child would point nowhere.
        let mut c = db.cursor();
        let mut d = db.cursor();
        c.delete("order", order).unwrap();
        d.insert("order_line", vals(&[("order_id", Value::Id(order))])).unwrap();
        c.commit().unwrap();
        assert!(matches!(d.commit(), Err(StoreError::SerializationConflict(_))));

        let after = db.cursor();
        assert!(!after.exists("order", order).unwrap());
        assert!(!after.exists("order_line", line).unwrap());
        assert_eq!(after.count("order_line", &Filter::True).unwrap(), 0);
    }

    #[test]
    fn constraints_are_enforced() {
        let db = setup();
        let mut cr = db.cursor();
        assert!(matches!(
            cr.insert("order", Values::new()),
            Err(StoreError::NotNull { .. })
        ));
        cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        assert!(matches!(
            cr.insert("order", vals(&[("name", "A".into())])),
            Err(StoreError::UniqueViolation { .. })
        ));
        assert!(matches!(
            cr.insert("order_line", vals(&[("order_id", Value::Id(999))])),
            Err(StoreError::ForeignKeyViolation { .. })
        ));
        assert!(matches!(
            cr.insert("order_line", vals(&[("subtotal", "x".into())])),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn delete_cascades_and_restricts() {
        let db = setup();
        let mut cr = db.cursor();
        let order = cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        let line = cr
            .insert("order_line", vals(&[("order_id", Value::Id(order)), ("subtotal", Value::Int(3))]))
            .unwrap();
        assert_eq!(
            cr.get("order_line", line).unwrap().unwrap().get("subtotal"),
            Value::Float(3.0)
        );

        let invoice = cr.insert("invoice", vals(&[("order_id", Value::Id(order))])).unwrap();
        assert!(matches!(cr.delete("order", order), Err(StoreError::Restricted { .. })));
        // The failed delete left everything in place.
        assert!(cr.exists("order_line", line).unwrap());

        cr.delete("invoice", invoice).unwrap();
        cr.delete("order", order).unwrap();
        assert!(!cr.exists("order_line", line).unwrap());
    }

    #[test]
    fn savepoints_undo_nested_work() {
        let db = setup();
        let mut cr = db.cursor();
        cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        let sp = cr.savepoint();
        cr.insert("order", vals(&[("name", "B".into())])).unwrap();
        cr.rollback_to(sp);
        assert_eq!(cr.count("order", &Filter::True).unwrap(), 1);
    }

    #[test]
    fn select_orders_nulls_last_and_breaks_ties_by_id() {
        let db = setup();
        let mut cr = db.cursor();
        let o = cr.insert("order", vals(&[("name", "A".into())])).unwrap();
        let l1 = cr.insert("order_line", vals(&[("subtotal", Value::Float(2.0))])).unwrap();
        let l2 = cr.insert("order_line", Values::new()).unwrap();
        let l3 = cr
            .insert("order_line", vals(&[("subtotal", Value::Float(1.0)), ("order_id", Value::Id(o))]))
            .unwrap();
        let l4 = cr.insert("order_line", vals(&[("subtotal", Value::Float(2.0))])).unwrap();

        let ids = cr
            .select_ids("order_line", &Filter::True, &[OrderBy::asc("subtotal")], 0, None)
            .unwrap();
        assert_eq!(ids, vec![l3, l1, l4, l2]);

        let joined = cr
            .select_ids(
                "order_line",
                &Filter::Join {
                    col: "order_id".into(),
                    table: "order".into(),
                    filter: Box::new(Filter::eq("name", "A")),
                },
                &[],
                0,
                None,
            )
            .unwrap();
        assert_eq!(joined, vec![l3]);

        let with_lines = cr
            .select_ids(
                "order",
                &Filter::Exists {
                    table: "order_line".into(),
                    column: "order_id".into(),
                    filter: Box::new(Filter::True),
                },
                &[],
                0,
                Some(1),
            )
            .unwrap();
        assert_eq!(with_lines, vec![o]);
    }

    #[test]
    fn expired_deadline_aborts_the_cursor() {
        let db = setup();
        let cr = db.cursor_with_deadline(Instant::now());
        assert_eq!(cr.count("order", &Filter::True), Err(StoreError::DeadlineExceeded));
        assert_eq!(cr.count("order", &Filter::True), Err(StoreError::Aborted));
    }

    #[test]
    fn committed_state_survives_reopen() {
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let db = Database::open("p", snapshots.clone()).unwrap();
        let mut cr = db.cursor();
        cr.reconcile(&TableDef::new("t").column(ColumnDef::new("n", ColumnType::Integer)))
            .unwrap();
        let id = cr.insert("t", vals(&[("n", Value::Int(5))])).unwrap();
        cr.commit().unwrap();

        let reopened = Database::open("p", snapshots).unwrap();
        let mut cr = reopened.cursor();
        assert_eq!(cr.get("t", id).unwrap().unwrap().get("n"), Value::Int(5));
        let next = cr.insert("t", Values::new()).unwrap();
        assert!(next > id);
    }

    #[test]
    fn widening_a_column_converts_rows() {
        let db = Database::in_memory("w");
        let mut cr = db.cursor();
        cr.reconcile(&TableDef::new("t").column(ColumnDef::new("name", ColumnType::Varchar(None))))
            .unwrap();
        let id = cr.insert("t", vals(&[("name", "Chair".into())])).unwrap();
        cr.reconcile(&TableDef::new("t").column(ColumnDef::new("name", ColumnType::Jsonb)))
            .unwrap();
        let value = cr.get("t", id).unwrap().unwrap().get("name");
        assert_eq!(value.translation("fr_FR"), Some("Chair"));
    }
}
