use serde::Serialize;

/// A module whose transaction was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleFailure {
    pub module: String,
    pub error: String,
}

/// Outcome of one install, upgrade or uninstall run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub installed: Vec<String>,
    pub upgraded: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<ModuleFailure>,
    /// Modules not attempted because a dependency failed.
    pub skipped: Vec<String>,
}

impl LoadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub(crate) fn fail(&mut self, module: &str, error: impl ToString) {
        self.failed.push(ModuleFailure {
            module: module.to_string(),
            error: error.to_string(),
        });
    }

    /// Whether `module` failed or was skipped in this run.
    pub fn is_broken(&self, module: &str) -> bool {
        self.skipped.iter().any(|m| m == module) || self.failed.iter().any(|f| f.module == module)
    }
}
