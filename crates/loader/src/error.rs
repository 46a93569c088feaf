use strata_core::OrmError;
use thiserror::Error;

/// Failure while resolving, parsing or installing modules.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid manifest for '{module}': {message}")]
    Manifest { module: String, message: String },

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("module '{module}' depends on '{dependency}', which is not available")]
    MissingDependency { module: String, dependency: String },

    #[error("dependency cycle between modules: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("module '{0}' is not installable")]
    NotInstallable(String),

    #[error("module '{0}' is not installed")]
    NotInstalled(String),

    #[error("module '{0}' cannot be uninstalled")]
    CannotUninstall(String),

    #[error("{module}/{file}{}: {message}", position.map(|p| format!(" (line {p})")).unwrap_or_default())]
    DataFile {
        module: String,
        file: String,
        position: Option<u64>,
        message: String,
    },

    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Orm(#[from] OrmError),

    #[error("installing '{module}' failed: {source}")]
    Module {
        module: String,
        #[source]
        source: Box<LoadError>,
    },
}

impl LoadError {
    pub(crate) fn data_file(
        module: &str,
        file: &str,
        position: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        LoadError::DataFile {
            module: module.to_string(),
            file: file.to_string(),
            position,
            message: message.into(),
        }
    }

    pub(crate) fn in_module(self, module: &str) -> Self {
        match self {
            already @ LoadError::Module { .. } => already,
            other => LoadError::Module {
                module: module.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The ORM error at the root of this failure, if any.
    pub fn orm_error(&self) -> Option<&OrmError> {
        match self {
            LoadError::Orm(err) => Some(err),
            LoadError::Module { source, .. } => source.orm_error(),
            _ => None,
        }
    }
}

impl From<LoadError> for OrmError {
    fn from(value: LoadError) -> Self {
        if let Some(err) = value.orm_error() {
            return err.clone();
        }
        match &value {
            LoadError::UnknownModule(_) | LoadError::NotInstalled(_) => OrmError::missing(value.to_string()),
            _ => OrmError::user(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_file_errors_name_the_line() {
        let err = LoadError::data_file("m", "data/a.xml", Some(4), "unknown field 'x'");
        assert_eq!(err.to_string(), "m/data/a.xml (line 4): unknown field 'x'");
    }

    #[test]
    fn orm_errors_survive_the_module_wrapper() {
        let err = LoadError::from(OrmError::validation("bad")).in_module("m");
        assert_eq!(OrmError::from(err), OrmError::validation("bad"));
    }

    #[test]
    fn cycles_list_their_members() {
        let err = LoadError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle between modules: a -> b -> a");
    }
}
