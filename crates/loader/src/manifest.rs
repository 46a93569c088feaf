//! Addon manifests (`manifest.toml`).

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::LoadError;

/// Declaration of an addon: identity, dependencies and data files.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub depends: Vec<String>,
    /// Data files played on install and upgrade, in order.
    #[serde(default)]
    pub data: Vec<String>,
    /// Data files played unless demo data is disabled.
    #[serde(default)]
    pub demo: Vec<String>,
    #[serde(default = "default_true")]
    pub installable: bool,
    #[serde(default)]
    pub application: bool,
    #[serde(default)]
    pub auto_install: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self, LoadError> {
        let manifest: Manifest = toml::from_str(raw).map_err(|err| LoadError::Manifest {
            module: "?".to_string(),
            message: err.to_string(),
        })?;
        manifest.validate()?;
        for key in manifest.extra.keys() {
            warn!(module = %manifest.name, key, "ignoring unknown manifest key");
        }
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), LoadError> {
        let invalid = |message: String| LoadError::Manifest {
            module: self.name.clone(),
            message,
        };
        if !is_module_name(&self.name) {
            return Err(invalid(format!("'{}' is not a valid module name", self.name)));
        }
        if let Some(dep) = self.depends.iter().find(|d| !is_module_name(d)) {
            return Err(invalid(format!("'{dep}' is not a valid dependency name")));
        }
        if self.depends.contains(&self.name) {
            return Err(invalid("a module cannot depend on itself".to_string()));
        }
        Ok(())
    }

    /// Declared dependencies, with `base` implied for every other module.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = self.depends.clone();
        if self.name != strata_base::MODULE && !deps.iter().any(|d| d == strata_base::MODULE) {
            deps.insert(0, strata_base::MODULE.to_string());
        }
        deps
    }
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_keys() {
        let manifest = Manifest::parse(r#"name = "sale""#).unwrap();
        assert!(manifest.installable);
        assert!(!manifest.auto_install);
        assert_eq!(manifest.version, "1.0");
        assert_eq!(manifest.dependencies(), vec!["base".to_string()]);
    }

    #[test]
    fn unknown_keys_are_kept_aside() {
        let manifest = Manifest::parse(
            r#"
            name = "sale"
            depends = ["base", "product"]
            author = "someone"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.dependencies(), vec!["base".to_string(), "product".to_string()]);
        assert!(manifest.extra.contains_key("author"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = Manifest::parse(r#"name = "a"
depends = ["a"]"#)
        .unwrap_err();
        assert!(matches!(err, LoadError::Manifest { .. }), "{err}");
    }

    #[test]
    fn names_are_snake_case() {
        assert!(Manifest::parse(r#"name = "Sale Order""#).is_err());
        assert!(Manifest::parse(r#"name = "x"
depends = ["bad-name"]"#)
        .is_err());
    }
}
