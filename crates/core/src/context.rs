//! Immutable per-call context mapping.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::error::{OrmError, OrmResult};
use crate::id::RecordId;
use crate::value::DEFAULT_LANG;

/// Context key holding the active language.
pub const LANG: &str = "lang";
/// Context key controlling whether archived records are hidden from searches.
pub const ACTIVE_TEST: &str = "active_test";
/// Context key holding the companies the call may see; the first one is current.
pub const ALLOWED_COMPANY_IDS: &str = "allowed_company_ids";
/// Context key suppressing audit trails during bulk imports.
pub const TRACKING_DISABLE: &str = "tracking_disable";
/// Context key set by the module loader while playing data files.
pub const INSTALL_MODE: &str = "install_mode";

/// Immutable key/value mapping carried by an environment.
///
/// Every `with*` method returns a new context; the original is untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: Arc<Map<String, JsonValue>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object (`null` is an empty context).
    pub fn from_json(value: &JsonValue) -> OrmResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::default()),
            JsonValue::Object(map) => Ok(Self {
                values: Arc::new(map.clone()),
            }),
            other => Err(OrmError::validation(format!(
                "context must be an object, got {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object((*self.values).clone())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// New context with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let mut map = (*self.values).clone();
        map.insert(key.into(), value.into());
        Self {
            values: Arc::new(map),
        }
    }

    /// New context with every entry of `overrides` applied.
    pub fn with_all(&self, overrides: &Map<String, JsonValue>) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut map = (*self.values).clone();
        for (k, v) in overrides {
            map.insert(k.clone(), v.clone());
        }
        Self {
            values: Arc::new(map),
        }
    }

    /// New context without `key`.
    pub fn without(&self, key: &str) -> Self {
        if !self.values.contains_key(key) {
            return self.clone();
        }
        let mut map = (*self.values).clone();
        map.remove(key);
        Self {
            values: Arc::new(map),
        }
    }

    /// Truthy flag lookup; absent keys are false.
    pub fn flag(&self, key: &str) -> bool {
        match self.values.get(key) {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(JsonValue::String(s)) => !s.is_empty(),
            Some(JsonValue::Array(a)) => !a.is_empty(),
            Some(JsonValue::Object(o)) => !o.is_empty(),
        }
    }

    pub fn lang(&self) -> &str {
        self.values
            .get(LANG)
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_LANG)
    }

    /// Archived records are hidden unless `active_test` is explicitly false.
    pub fn active_test(&self) -> bool {
        !matches!(self.values.get(ACTIVE_TEST), Some(JsonValue::Bool(false)))
    }

    pub fn company_ids(&self) -> Vec<RecordId> {
        self.values
            .get(ALLOWED_COMPANY_IDS)
            .and_then(JsonValue::as_array)
            .map(|ids| ids.iter().filter_map(JsonValue::as_i64).collect())
            .unwrap_or_default()
    }

    /// Default value supplied through a `default_<field>` key.
    pub fn default_for(&self, field: &str) -> Option<&JsonValue> {
        self.values.get(&format!("default_{field}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_returns_a_new_context() {
        let base = Context::new();
        let fr = base.with(LANG, "fr_FR");
        assert_eq!(base.lang(), "en_US");
        assert_eq!(fr.lang(), "fr_FR");
    }

    #[test]
    fn active_test_defaults_to_true() {
        let ctx = Context::new();
        assert!(ctx.active_test());
        assert!(!ctx.with(ACTIVE_TEST, false).active_test());
    }

    #[test]
    fn default_keys_are_looked_up_by_field_name() {
        let ctx = Context::from_json(&json!({"default_qty": 4})).unwrap();
        assert_eq!(ctx.default_for("qty"), Some(&json!(4)));
        assert_eq!(ctx.default_for("name"), None);
    }

    #[test]
    fn non_object_contexts_are_rejected() {
        assert!(Context::from_json(&json!([1, 2])).is_err());
    }
}
