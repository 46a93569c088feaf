//! Table-level predicates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::Value;

use super::error::{StoreError, StoreResult};
use super::table::{Row, Table};

/// Column access, optionally reading translatable cells in a given language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Col {
    pub name: String,
    pub lang: Option<String>,
}

impl Col {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: None,
        }
    }

    pub fn translated(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: Some(lang.into()),
        }
    }

    fn read(&self, row: &Row) -> Value {
        let value = row.get(&self.name);
        match (&self.lang, &value) {
            (Some(lang), Value::Translated(_)) => value
                .translation(lang)
                .map(|s| Value::Text(s.to_string()))
                .unwrap_or_default(),
            (None, Value::Translated(_)) => value
                .translation(strata_core::value::DEFAULT_LANG)
                .map(|s| Value::Text(s.to_string()))
                .unwrap_or_default(),
            _ => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Predicate over the rows of one table.
///
/// Comparisons follow SQL semantics: a null cell never satisfies `Cmp`, `In`
/// or `Like`, so callers wanting nulls must say so with `IsNull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    True,
    False,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Cmp {
        col: Col,
        op: CmpOp,
        value: Value,
    },
    In {
        col: Col,
        values: Vec<Value>,
    },
    Like {
        col: Col,
        pattern: String,
        case_insensitive: bool,
    },
    IsNull(Col),
    /// The referenced row of `table` through single-ref `col` satisfies `filter`.
    Join {
        col: String,
        table: String,
        filter: Box<Filter>,
    },
    /// Some row of `table` whose `column` references this row satisfies `filter`.
    Exists {
        table: String,
        column: String,
        filter: Box<Filter>,
    },
}

impl Filter {
    pub fn eq(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            col: Col::new(col),
            op: CmpOp::Eq,
            value: value.into(),
        }
    }

    pub fn ids(ids: &[strata_core::RecordId]) -> Self {
        Filter::In {
            col: Col::new("id"),
            values: ids.iter().map(|id| Value::Id(*id)).collect(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(filters.len());
        for f in filters {
            match f {
                Filter::True => {}
                Filter::False => return Filter::False,
                Filter::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Filter::True,
            1 => flat.pop().unwrap_or(Filter::True),
            _ => Filter::And(flat),
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(filters.len());
        for f in filters {
            match f {
                Filter::False => {}
                Filter::True => return Filter::True,
                Filter::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Filter::False,
            1 => flat.pop().unwrap_or(Filter::False),
            _ => Filter::Or(flat),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        match filter {
            Filter::True => Filter::False,
            Filter::False => Filter::True,
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }
}

/// Read access to the tables a filter may traverse.
pub(crate) trait TableLookup {
    fn lookup(&self, name: &str) -> StoreResult<&Table>;
}

impl TableLookup for BTreeMap<String, std::sync::Arc<Table>> {
    fn lookup(&self, name: &str) -> StoreResult<&Table> {
        self.get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }
}

pub(crate) fn matches(
    tables: &dyn TableLookup,
    table: &Table,
    row: &Row,
    filter: &Filter,
) -> StoreResult<bool> {
    Ok(match filter {
        Filter::True => true,
        Filter::False => false,
        Filter::And(items) => {
            for f in items {
                if !matches(tables, table, row, f)? {
                    return Ok(false);
                }
            }
            true
        }
        Filter::Or(items) => {
            for f in items {
                if matches(tables, table, row, f)? {
                    return Ok(true);
                }
            }
            false
        }
        Filter::Not(inner) => !matches(tables, table, row, inner)?,
        Filter::Cmp { col, op, value } => {
            check_column(table, &col.name)?;
            let cell = col.read(row);
            if cell.is_null() || value.is_null() {
                false
            } else if *op == CmpOp::Eq {
                cell.loose_eq(value)
            } else if *op == CmpOp::Ne {
                !cell.loose_eq(value)
            } else {
                cell.partial_cmp_value(value).is_some_and(|o| op.holds(o))
            }
        }
        Filter::In { col, values } => {
            check_column(table, &col.name)?;
            let cell = col.read(row);
            !cell.is_null() && values.iter().any(|v| cell.loose_eq(v))
        }
        Filter::Like {
            col,
            pattern,
            case_insensitive,
        } => {
            check_column(table, &col.name)?;
            match col.read(row) {
                Value::Null => false,
                Value::Text(s) => like_match(pattern, &s, *case_insensitive),
                other => {
                    let text = match other.to_json() {
                        serde_json::Value::String(s) => s,
                        json => json.to_string(),
                    };
                    like_match(pattern, &text, *case_insensitive)
                }
            }
        }
        Filter::IsNull(col) => {
            check_column(table, &col.name)?;
            col.read(row).is_null()
        }
        Filter::Join {
            col,
            table: target,
            filter,
        } => {
            check_column(table, col)?;
            let Some(id) = row.get(col).as_id() else {
                return Ok(false);
            };
            let target = tables.lookup(target)?;
            match target.row(id) {
                Some(target_row) => matches(tables, target, target_row, filter)?,
                None => false,
            }
        }
        Filter::Exists {
            table: source,
            column,
            filter,
        } => {
            let source = tables.lookup(source)?;
            check_column(source, column)?;
            for candidate in source.rows.values() {
                if candidate.get(column).as_id() == Some(row.id)
                    && matches(tables, source, candidate, filter)?
                {
                    return Ok(true);
                }
            }
            false
        }
    })
}

fn check_column(table: &Table, column: &str) -> StoreResult<()> {
    if table.def.has_column(column) {
        Ok(())
    } else {
        Err(StoreError::UnknownColumn {
            table: table.name().to_string(),
            column: column.to_string(),
        })
    }
}

/// SQL `LIKE` matching: `%` is any run, `_` any single character, `\` escapes.
pub fn like_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let text = fold(text);

    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = fold(pattern).into_iter();
    while let Some(c) = chars.next() {
        match c {
            '%' => toks.push(Tok::Any),
            '_' => toks.push(Tok::One),
            '\\' => toks.push(Tok::Lit(chars.next().unwrap_or('\\'))),
            c => toks.push(Tok::Lit(c)),
        }
    }

    // Greedy matcher with backtracking to the last `%`.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match toks.get(p) {
            Some(Tok::Any) => {
                star = Some((p, t));
                p += 1;
            }
            Some(Tok::One) => {
                p += 1;
                t += 1;
            }
            Some(Tok::Lit(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    toks[p..].iter().all(|t| *t == Tok::Any)
}

/// Sort key of a `select`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub col: Col,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(col: impl Into<String>) -> Self {
        Self {
            col: Col::new(col),
            descending: false,
        }
    }

    pub fn desc(col: impl Into<String>) -> Self {
        Self {
            col: Col::new(col),
            descending: true,
        }
    }
}

/// Compare two rows by `order`; nulls sort last ascending (first descending),
/// and ties break by id ascending.
pub(crate) fn compare_rows(a: &Row, b: &Row, order: &[OrderBy]) -> Ordering {
    for key in order {
        let ord = key.col.read(a).sort_cmp(&key.col.read(b));
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}
