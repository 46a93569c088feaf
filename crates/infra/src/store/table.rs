use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::{RecordId, Value};

use super::schema::TableDef;

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RecordId,
    /// Commit sequence number of the last committed write to this row.
    pub version: u64,
    pub values: BTreeMap<String, Value>,
}

impl Row {
    /// Column value; absent columns read as null and `id` reads as a reference.
    pub fn get(&self, column: &str) -> Value {
        if column == "id" {
            return Value::Id(self.id);
        }
        self.values.get(column).cloned().unwrap_or_default()
    }

    pub fn get_ref(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

/// Definition plus rows of one table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub def: TableDef,
    /// Bumped on every committed definition change.
    pub def_version: u64,
    pub rows: BTreeMap<RecordId, Row>,
}

impl Table {
    pub fn new(def: TableDef) -> Self {
        Self {
            def,
            def_version: 0,
            rows: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn row(&self, id: RecordId) -> Option<&Row> {
        self.rows.get(&id)
    }
}
