//! Server configuration.
//!
//! Layering, lowest precedence first: built-in defaults, a TOML file, then
//! `STRATA_*` environment variables. Command-line flags are applied on top by
//! the server binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub db_name: String,
    /// Directory of database snapshots; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Directories scanned for data-only addons.
    pub addons_path: Vec<PathBuf>,
    pub http_bind: String,
    pub without_demo: bool,
    pub load_language: Option<String>,
    pub call_timeout_secs: u64,
    pub session_ttl_minutes: u64,
    pub log_level: String,
    /// `json` or `pretty`.
    pub log_format: String,
    /// Password given to the `admin` user when the database is created.
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_name: "strata".to_string(),
            data_dir: None,
            addons_path: Vec::new(),
            http_bind: "127.0.0.1:8069".to_string(),
            without_demo: false,
            load_language: None,
            call_timeout_secs: 120,
            session_ttl_minutes: 60 * 24,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

/// Prefix of the environment variables read by [`ServerConfig::apply_env`].
pub const ENV_PREFIX: &str = "STRATA_";

impl ServerConfig {
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Defaults, overridden by the TOML file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Apply `STRATA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `STRATA_*` overrides looked up through `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("DB_NAME") {
            self.db_name = v;
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = get("ADDONS_PATH") {
            self.addons_path = std::env::split_paths(&v).collect();
        }
        if let Some(v) = get("HTTP_BIND") {
            self.http_bind = v;
        }
        if let Some(v) = get("WITHOUT_DEMO") {
            self.without_demo = parse_bool("STRATA_WITHOUT_DEMO", &v)?;
        }
        if let Some(v) = get("LOAD_LANGUAGE") {
            self.load_language = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = get("CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = parse_num("STRATA_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("SESSION_TTL_MINUTES") {
            self.session_ttl_minutes = parse_num("STRATA_SESSION_TTL_MINUTES", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = v;
        }
        if let Some(v) = get("ADMIN_PASSWORD") {
            self.admin_password = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_name.is_empty()
            || !self
                .db_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidValue {
                key: "db_name".into(),
                value: self.db_name.clone(),
            });
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidValue {
                key: "log_format".into(),
                value: self.log_format.clone(),
            });
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_num(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_overrides_defaults() {
        let cfg = ServerConfig::from_toml_str(
            "db_name = \"prod\"\nwithout_demo = true\naddons_path = [\"/opt/addons\"]\n",
            Path::new("strata.toml"),
        )
        .unwrap();
        assert_eq!(cfg.db_name, "prod");
        assert!(cfg.without_demo);
        assert_eq!(cfg.addons_path, vec![PathBuf::from("/opt/addons")]);
        assert_eq!(cfg.http_bind, ServerConfig::default().http_bind);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ServerConfig::from_toml_str("dbname = \"x\"", Path::new("a.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("STRATA_DB_NAME", "envdb"),
            ("STRATA_WITHOUT_DEMO", "yes"),
            ("STRATA_CALL_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let mut cfg = ServerConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.db_name, "envdb");
        assert!(cfg.without_demo);
        assert_eq!(cfg.call_timeout_secs, 5);
    }

    #[test]
    fn bad_environment_values_fail() {
        let mut cfg = ServerConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "STRATA_CALL_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
