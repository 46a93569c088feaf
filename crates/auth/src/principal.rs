use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strata_core::{RecordId, SUPERUSER_ID};

/// A fully resolved user for authorization decisions.
///
/// Construction is decoupled from storage: the caller resolves the user's
/// groups (implied groups included) and companies beforehand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uid: RecordId,
    pub login: String,
    pub groups: BTreeSet<RecordId>,
    pub company_id: Option<RecordId>,
    pub company_ids: Vec<RecordId>,
    /// Elevated (`sudo`) environment.
    pub su: bool,
}

impl Principal {
    pub fn new(uid: RecordId, login: impl Into<String>) -> Self {
        Self {
            uid,
            login: login.into(),
            groups: BTreeSet::new(),
            company_id: None,
            company_ids: Vec::new(),
            su: false,
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = RecordId>) -> Self {
        self.groups.extend(groups);
        self
    }

    /// The superuser and elevated environments bypass access control.
    pub fn is_superuser(&self) -> bool {
        self.su || self.uid == SUPERUSER_ID
    }

    pub fn in_group(&self, group: RecordId) -> bool {
        self.groups.contains(&group)
    }

    pub fn in_any(&self, groups: &[RecordId]) -> bool {
        groups.iter().any(|g| self.groups.contains(g))
    }
}
