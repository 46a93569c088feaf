//! Model contributions and the merged model descriptor.
//!
//! Modules never define models directly: each contributes a [`ModelDef`]
//! (a new model, an extension of an existing one, or an abstract mixin) and
//! the registry folds the contributions, in module order, into one final
//! [`Model`] per name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_core::{OrmError, OrmResult};
use strata_infra::store::TableDef;

use crate::field::Field;
use crate::recordset::RecordSet;

/// Implementation of a model method.
///
/// Receives the recordset the method is called on, positional and keyword
/// arguments, and a handle on the implementation it overrides.
pub type MethodFn =
    Arc<dyn Fn(&RecordSet, &[JsonValue], &JsonMap<String, JsonValue>, &Super<'_>) -> OrmResult<JsonValue> + Send + Sync>;
/// Check constraint run on the records it applies to.
pub type CheckFn = Arc<dyn Fn(&RecordSet) -> OrmResult<()> + Send + Sync>;
/// Custom display name of one record.
pub type NameFn = Arc<dyn Fn(&RecordSet) -> OrmResult<String> + Send + Sync>;

#[derive(Clone)]
pub struct Method {
    pub name: String,
    /// Reachable over RPC.
    pub public: bool,
    /// Called on the model rather than on records: RPC passes no ids.
    pub model_level: bool,
    pub module: String,
    pub func: MethodFn,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("public", &self.public)
            .field("model_level", &self.model_level)
            .field("module", &self.module)
            .finish()
    }
}

/// Handle on the overridden implementation of a method.
///
/// Below the first contributed implementation sit the built-in record
/// methods (`create`, `write`, `read`, ...).
pub struct Super<'a> {
    name: &'a str,
    chain: &'a [Method],
}

impl<'a> Super<'a> {
    pub(crate) fn new(name: &'a str, chain: &'a [Method]) -> Self {
        Self { name, chain }
    }

    pub fn call(
        &self,
        records: &RecordSet,
        args: &[JsonValue],
        kwargs: &JsonMap<String, JsonValue>,
    ) -> OrmResult<JsonValue> {
        match self.chain.split_last() {
            Some((last, rest)) => (last.func)(records, args, kwargs, &Super::new(self.name, rest)),
            None => records.call_builtin(self.name, args, kwargs),
        }
    }
}

#[derive(Clone)]
pub struct Constraint {
    pub name: String,
    /// Fields whose modification triggers the check.
    pub fields: Vec<String>,
    pub check: CheckFn,
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConstraint {
    pub name: String,
    pub columns: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    New,
    Extend,
    Abstract,
}

/// One module's contribution to a model.
#[derive(Clone)]
pub struct ModelDef {
    pub name: String,
    pub kind: ModelKind,
    pub module: String,
    pub description: Option<String>,
    /// Prototype parents: their fields and methods are copied.
    pub inherit: Vec<String>,
    /// Delegation parents with the reference field pointing at them.
    pub inherits: Vec<(String, String)>,
    pub fields: Vec<Field>,
    pub order: Option<String>,
    pub rec_name: Option<String>,
    pub parent_name: Option<String>,
    pub constraints: Vec<Constraint>,
    pub sql_constraints: Vec<SqlConstraint>,
    pub methods: Vec<Method>,
    pub display_name: Option<NameFn>,
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("module", &self.module)
            .field("inherit", &self.inherit)
            .field("fields", &self.fields.iter().map(|f| &f.name).collect::<Vec<_>>())
            .finish()
    }
}

impl ModelDef {
    fn blank(name: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            module: String::new(),
            description: None,
            inherit: Vec::new(),
            inherits: Vec::new(),
            fields: Vec::new(),
            order: None,
            rec_name: None,
            parent_name: None,
            constraints: Vec::new(),
            sql_constraints: Vec::new(),
            methods: Vec::new(),
            display_name: None,
        }
    }

    /// A new model with its own table.
    pub fn new(name: impl Into<String>) -> Self {
        Self::blank(name, ModelKind::New)
    }

    /// Classical inheritance: add to an existing model in place.
    pub fn extend(name: impl Into<String>) -> Self {
        Self::blank(name, ModelKind::Extend)
    }

    /// A mixin without table, only usable as a prototype parent.
    pub fn abstract_model(name: impl Into<String>) -> Self {
        Self::blank(name, ModelKind::Abstract)
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        let module = module.into();
        for m in &mut self.methods {
            m.module = module.clone();
        }
        self.module = module;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inherit(mut self, parent: impl Into<String>) -> Self {
        self.inherit.push(parent.into());
        self
    }

    pub fn inherits(mut self, parent: impl Into<String>, field: impl Into<String>) -> Self {
        self.inherits.push((parent.into(), field.into()));
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn rec_name(mut self, field: impl Into<String>) -> Self {
        self.rec_name = Some(field.into());
        self
    }

    pub fn parent_name(mut self, field: impl Into<String>) -> Self {
        self.parent_name = Some(field.into());
        self
    }

    pub fn constraint(
        mut self,
        name: impl Into<String>,
        fields: &[&str],
        check: impl Fn(&RecordSet) -> OrmResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.constraints.push(Constraint {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            check: Arc::new(check),
        });
        self
    }

    pub fn unique(mut self, name: impl Into<String>, columns: &[&str], message: impl Into<String>) -> Self {
        self.sql_constraints.push(SqlConstraint {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            message: message.into(),
        });
        self
    }

    fn push_method(mut self, name: impl Into<String>, public: bool, model_level: bool, func: MethodFn) -> Self {
        self.methods.push(Method {
            name: name.into(),
            public,
            model_level,
            module: self.module.clone(),
            func,
        });
        self
    }

    /// A method callable over RPC.
    pub fn method(
        self,
        name: impl Into<String>,
        func: impl Fn(&RecordSet, &[JsonValue], &JsonMap<String, JsonValue>, &Super<'_>) -> OrmResult<JsonValue>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let name = name.into();
        let public = !name.starts_with('_');
        self.push_method(name, public, false, Arc::new(func))
    }

    /// A public method called on the model itself, without records.
    pub fn model_method(
        self,
        name: impl Into<String>,
        func: impl Fn(&RecordSet, &[JsonValue], &JsonMap<String, JsonValue>, &Super<'_>) -> OrmResult<JsonValue>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let name = name.into();
        let public = !name.starts_with('_');
        self.push_method(name, public, true, Arc::new(func))
    }

    /// A method only reachable from code.
    pub fn private_method(
        self,
        name: impl Into<String>,
        func: impl Fn(&RecordSet, &[JsonValue], &JsonMap<String, JsonValue>, &Super<'_>) -> OrmResult<JsonValue>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.push_method(name, false, false, Arc::new(func))
    }

    pub fn display_name_with(
        mut self,
        f: impl Fn(&RecordSet) -> OrmResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.display_name = Some(Arc::new(f));
        self
    }
}

/// Final, merged descriptor of one model.
#[derive(Clone)]
pub struct Model {
    pub name: String,
    pub description: String,
    /// Derived once from the name.
    pub table: String,
    pub is_abstract: bool,
    pub fields: IndexMap<String, Field>,
    pub order: String,
    pub rec_name: Option<String>,
    pub parent_name: Option<String>,
    pub inherits: Vec<(String, String)>,
    pub constraints: Vec<Constraint>,
    pub sql_constraints: Vec<SqlConstraint>,
    pub methods: BTreeMap<String, Vec<Method>>,
    pub display_name: Option<NameFn>,
    /// Modules that contributed, in load order.
    pub modules: Vec<String>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("modules", &self.modules)
            .finish()
    }
}

/// Table name of a model: dots become underscores.
pub fn table_name(model: &str) -> String {
    model.replace('.', "_")
}

impl Model {
    pub fn field(&self, name: &str) -> OrmResult<&Field> {
        self.fields
            .get(name)
            .ok_or_else(|| OrmError::unknown_field(&self.name, name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Models with an `active` boolean hide archived records from searches.
    pub fn has_active(&self) -> bool {
        self.fields.get("active").is_some_and(|f| f.has_column())
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values().filter(|f| f.has_column() && f.name != "id")
    }

    /// Implementations of `name`, earliest first.
    pub fn method_chain(&self, name: &str) -> &[Method] {
        self.methods.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_public_method(&self, name: &str) -> bool {
        self.method_chain(name).last().is_some_and(|m| m.public)
    }

    /// Desired table definition for schema reconciliation.
    pub(crate) fn table_def(&self, table_of: impl Fn(&str) -> Option<String>) -> TableDef {
        let mut def = TableDef::new(&self.table);
        for field in self.stored_fields() {
            let comodel_table = field.comodel().and_then(&table_of);
            let mut column = field.column(comodel_table.as_deref());
            if field.required && !field.is_computed() {
                column = column.not_null();
            }
            def = def.column(column);
        }
        for c in &self.sql_constraints {
            let cols: Vec<&str> = c.columns.iter().map(String::as_str).collect();
            def = def.unique(format!("{}_{}", self.table, c.name), &cols);
        }
        def
    }
}
