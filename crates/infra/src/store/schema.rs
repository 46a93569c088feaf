//! Table definitions and schema change plans.
//!
//! A plan is computed by diffing a desired [`TableDef`] against the one the
//! cursor currently sees. Plans only ever add or widen: columns and tables are
//! never dropped, so upgrades keep existing data.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strata_core::Value;

/// Storage type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    /// Bounded (or unbounded when `None`) character data.
    Varchar(Option<usize>),
    Text,
    Boolean,
    Date,
    Timestamp,
    Bytea,
    /// Structured values; translatable text lives here.
    Jsonb,
    /// Row id of another table.
    Ref,
}

impl ColumnType {
    pub fn sql_name(&self) -> String {
        match self {
            ColumnType::Integer | ColumnType::Ref => "INTEGER".into(),
            ColumnType::Float => "DOUBLE PRECISION".into(),
            ColumnType::Varchar(Some(n)) => format!("VARCHAR({n})"),
            ColumnType::Varchar(None) => "VARCHAR".into(),
            ColumnType::Text => "TEXT".into(),
            ColumnType::Boolean => "BOOLEAN".into(),
            ColumnType::Date => "DATE".into(),
            ColumnType::Timestamp => "TIMESTAMP".into(),
            ColumnType::Bytea => "BYTEA".into(),
            ColumnType::Jsonb => "JSONB".into(),
        }
    }

    /// Whether `value` may be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Integer, Value::Int(_)) => true,
            (ColumnType::Float, Value::Float(_) | Value::Int(_)) => true,
            (ColumnType::Varchar(limit), Value::Text(s)) => {
                limit.is_none_or(|n| s.chars().count() <= n)
            }
            (ColumnType::Text, Value::Text(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Date, Value::Date(_)) => true,
            (ColumnType::Timestamp, Value::DateTime(_)) => true,
            (ColumnType::Bytea, Value::Binary(_)) => true,
            (ColumnType::Jsonb, Value::Translated(_) | Value::Text(_) | Value::Ids(_)) => true,
            (ColumnType::Ref, Value::Id(_)) => true,
            _ => false,
        }
    }

    /// Normalize a value about to be stored (integers widen into float columns).
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (ColumnType::Float, Value::Int(i)) => Value::Float(i as f64),
            (ColumnType::Ref, Value::Int(i)) => Value::Id(i),
            (_, v) => v,
        }
    }

    /// Whether existing data of type `self` converts losslessly into `to`.
    pub fn widens_to(&self, to: &ColumnType) -> bool {
        match (self, to) {
            (a, b) if a == b => true,
            (ColumnType::Varchar(Some(a)), ColumnType::Varchar(Some(b))) => a <= b,
            (ColumnType::Varchar(_), ColumnType::Varchar(None) | ColumnType::Text) => true,
            (ColumnType::Text, ColumnType::Varchar(None)) => true,
            (ColumnType::Integer, ColumnType::Float) => true,
            (ColumnType::Varchar(_) | ColumnType::Text, ColumnType::Jsonb) => true,
            (ColumnType::Date, ColumnType::Timestamp) => true,
            _ => false,
        }
    }
}

/// What happens to referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnDelete {
    Restrict,
    Cascade,
    #[default]
    SetNull,
}

impl OnDelete {
    pub fn sql(self) -> &'static str {
        match self {
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub not_null: bool,
    pub index: bool,
    pub foreign_key: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            not_null: false,
            index: false,
            foreign_key: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, on_delete: OnDelete) -> Self {
        self.ty = ColumnType::Ref;
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            on_delete,
        });
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.ty.sql_name());
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(fk) = &self.foreign_key {
            sql.push_str(&format!(
                " REFERENCES {} ON DELETE {}",
                quote_ident(&fk.table),
                fk.on_delete.sql()
            ));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Definition of one table. The `id` column is implicit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: IndexMap<String, ColumnDef>,
    pub uniques: Vec<UniqueConstraint>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.insert(column.name.clone(), column);
        self
    }

    pub fn unique(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.uniques.push(UniqueConstraint {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == "id" || self.columns.contains_key(name)
    }

    /// Columns referencing `table`.
    pub fn references_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnDef> + 'a {
        self.columns
            .values()
            .filter(move |c| c.foreign_key.as_ref().is_some_and(|fk| fk.table == table))
    }

    pub fn to_create_sql(&self) -> String {
        let mut parts = vec![format!("{} SERIAL PRIMARY KEY", quote_ident("id"))];
        parts.extend(self.columns.values().map(ColumnDef::to_sql));
        for u in &self.uniques {
            let cols: Vec<_> = u.columns.iter().map(|c| quote_ident(c)).collect();
            parts.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                quote_ident(&u.name),
                cols.join(", ")
            ));
        }
        format!(
            "CREATE TABLE {} (\n    {}\n);",
            quote_ident(&self.name),
            parts.join(",\n    ")
        )
    }

    /// Changes that bring `current` (or nothing) up to `self`.
    pub fn plan_from(&self, current: Option<&TableDef>) -> Vec<SchemaChange> {
        let Some(current) = current else {
            let mut changes = vec![SchemaChange::CreateTable(self.clone())];
            for col in self.columns.values().filter(|c| c.index) {
                changes.push(SchemaChange::CreateIndex {
                    table: self.name.clone(),
                    column: col.name.clone(),
                });
            }
            return changes;
        };

        let table = &self.name;
        let mut changes = Vec::new();
        for col in self.columns.values() {
            let Some(existing) = current.columns.get(&col.name) else {
                changes.push(SchemaChange::AddColumn {
                    table: table.clone(),
                    column: ColumnDef {
                        not_null: false,
                        ..col.clone()
                    },
                });
                if col.not_null {
                    changes.push(SchemaChange::SetNotNull {
                        table: table.clone(),
                        column: col.name.clone(),
                    });
                }
                if col.index {
                    changes.push(SchemaChange::CreateIndex {
                        table: table.clone(),
                        column: col.name.clone(),
                    });
                }
                continue;
            };

            if existing.ty != col.ty {
                changes.push(SchemaChange::AlterColumnType {
                    table: table.clone(),
                    column: col.name.clone(),
                    from: existing.ty.clone(),
                    to: col.ty.clone(),
                });
            }
            if col.not_null && !existing.not_null {
                changes.push(SchemaChange::SetNotNull {
                    table: table.clone(),
                    column: col.name.clone(),
                });
            } else if !col.not_null && existing.not_null {
                changes.push(SchemaChange::DropNotNull {
                    table: table.clone(),
                    column: col.name.clone(),
                });
            }
            if col.index && !existing.index {
                changes.push(SchemaChange::CreateIndex {
                    table: table.clone(),
                    column: col.name.clone(),
                });
            }
            if col.foreign_key.is_some() && col.foreign_key != existing.foreign_key {
                if let Some(fk) = &col.foreign_key {
                    changes.push(SchemaChange::AddForeignKey {
                        table: table.clone(),
                        column: col.name.clone(),
                        foreign_key: fk.clone(),
                    });
                }
            }
        }
        for u in &self.uniques {
            if !current.uniques.iter().any(|c| c.name == u.name) {
                changes.push(SchemaChange::AddUnique {
                    table: table.clone(),
                    constraint: u.clone(),
                });
            }
        }
        changes
    }
}

/// One step of a schema reconciliation plan.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreateTable(TableDef),
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    AlterColumnType {
        table: String,
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    SetNotNull {
        table: String,
        column: String,
    },
    /// Relaxes a constraint only; no data is touched.
    DropNotNull {
        table: String,
        column: String,
    },
    CreateIndex {
        table: String,
        column: String,
    },
    AddUnique {
        table: String,
        constraint: UniqueConstraint,
    },
    AddForeignKey {
        table: String,
        column: String,
        foreign_key: ForeignKey,
    },
}

impl SchemaChange {
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable(def) => &def.name,
            SchemaChange::AddColumn { table, .. }
            | SchemaChange::AlterColumnType { table, .. }
            | SchemaChange::SetNotNull { table, .. }
            | SchemaChange::DropNotNull { table, .. }
            | SchemaChange::CreateIndex { table, .. }
            | SchemaChange::AddUnique { table, .. }
            | SchemaChange::AddForeignKey { table, .. } => table,
        }
    }

    /// PostgreSQL rendering of this change, used for logging.
    pub fn to_sql(&self) -> String {
        let qt = quote_ident(self.table());
        match self {
            SchemaChange::CreateTable(def) => def.to_create_sql(),
            SchemaChange::AddColumn { column, .. } => {
                format!("ALTER TABLE {qt} ADD COLUMN {};", column.to_sql())
            }
            SchemaChange::AlterColumnType { column, to, .. } => format!(
                "ALTER TABLE {qt} ALTER COLUMN {} TYPE {};",
                quote_ident(column),
                to.sql_name()
            ),
            SchemaChange::SetNotNull { column, .. } => format!(
                "ALTER TABLE {qt} ALTER COLUMN {} SET NOT NULL;",
                quote_ident(column)
            ),
            SchemaChange::DropNotNull { column, .. } => format!(
                "ALTER TABLE {qt} ALTER COLUMN {} DROP NOT NULL;",
                quote_ident(column)
            ),
            SchemaChange::CreateIndex { table, column } => format!(
                "CREATE INDEX {} ON {qt} ({});",
                quote_ident(&format!("{table}_{column}_index")),
                quote_ident(column)
            ),
            SchemaChange::AddUnique { constraint, .. } => {
                let cols: Vec<_> = constraint.columns.iter().map(|c| quote_ident(c)).collect();
                format!(
                    "ALTER TABLE {qt} ADD CONSTRAINT {} UNIQUE ({});",
                    quote_ident(&constraint.name),
                    cols.join(", ")
                )
            }
            SchemaChange::AddForeignKey {
                table,
                column,
                foreign_key,
            } => format!(
                "ALTER TABLE {qt} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ON DELETE {};",
                quote_ident(&format!("{table}_{column}_fkey")),
                quote_ident(column),
                quote_ident(&foreign_key.table),
                foreign_key.on_delete.sql()
            ),
        }
    }
}

/// Quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partner() -> TableDef {
        TableDef::new("res_partner")
            .column(ColumnDef::new("name", ColumnType::Varchar(None)).not_null())
            .column(ColumnDef::new("parent_id", ColumnType::Ref).references("res_partner", OnDelete::SetNull))
    }

    #[test]
    fn new_tables_are_created_whole() {
        let plan = partner().plan_from(None);
        assert!(matches!(plan.as_slice(), [SchemaChange::CreateTable(_)]));
        let sql = plan[0].to_sql();
        assert!(sql.starts_with("CREATE TABLE \"res_partner\""));
        assert!(sql.contains("\"name\" VARCHAR NOT NULL"));
        assert!(sql.contains("REFERENCES \"res_partner\" ON DELETE SET NULL"));
    }

    #[test]
    fn added_columns_are_planned_without_drops() {
        let current = partner();
        let desired = partner()
            .column(ColumnDef::new("email", ColumnType::Varchar(Some(64))).indexed());
        let plan = desired.plan_from(Some(&current));
        assert_eq!(plan.len(), 2);
        assert!(matches!(&plan[0], SchemaChange::AddColumn { column, .. } if column.name == "email"));
        assert!(matches!(&plan[1], SchemaChange::CreateIndex { column, .. } if column == "email"));

        // Columns missing from the desired definition are left alone.
        let shrunk = TableDef::new("res_partner");
        assert!(shrunk.plan_from(Some(&current)).is_empty());
    }

    #[test]
    fn varchar_limits_are_enforced() {
        let ty = ColumnType::Varchar(Some(3));
        assert!(ty.accepts(&Value::Text("abc".into())));
        assert!(!ty.accepts(&Value::Text("abcd".into())));
        assert!(ty.accepts(&Value::Null));
        assert!(!ty.accepts(&Value::Int(1)));
    }

    #[test]
    fn widening_is_directional() {
        assert!(ColumnType::Integer.widens_to(&ColumnType::Float));
        assert!(!ColumnType::Float.widens_to(&ColumnType::Integer));
        assert!(ColumnType::Varchar(Some(8)).widens_to(&ColumnType::Jsonb));
    }
}
