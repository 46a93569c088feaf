//! Record and external identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::OrmError;

/// Row identifier. Allocated per table, strictly increasing, never reused.
pub type RecordId = i64;

/// The superuser bypasses access control entirely.
pub const SUPERUSER_ID: RecordId = 1;

/// Stable `(module, name)` anchor mapped to a concrete record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct XmlId {
    pub module: String,
    pub name: String,
}

impl XmlId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Parse `"module.name"`, or qualify a bare `"name"` with `default_module`.
    pub fn qualify(raw: &str, default_module: &str) -> Result<Self, OrmError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OrmError::validation("empty external id"));
        }
        match raw.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(Self::new(module, name))
            }
            Some(_) => Err(OrmError::validation(format!("malformed external id '{raw}'"))),
            None => Ok(Self::new(default_module, raw)),
        }
    }
}

impl core::fmt::Display for XmlId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for XmlId {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(Self::new(module, name))
            }
            _ => Err(OrmError::validation(format!(
                "external id '{s}' must be of the form module.name"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_take_the_loading_module() {
        let id = XmlId::qualify("group_user", "base").unwrap();
        assert_eq!(id, XmlId::new("base", "group_user"));
    }

    #[test]
    fn qualified_names_keep_their_module() {
        let id = XmlId::qualify("sale.order_1", "base").unwrap();
        assert_eq!(id.to_string(), "sale.order_1");
    }

    #[test]
    fn from_str_requires_a_module() {
        assert!("nodot".parse::<XmlId>().is_err());
        assert!(".x".parse::<XmlId>().is_err());
    }
}
