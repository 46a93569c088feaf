use core::str::FromStr;

use serde::{Deserialize, Serialize};
use strata_core::RecordId;

/// The four operations access control distinguishes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    Create,
    Unlink,
}

impl AccessMode {
    pub const ALL: [AccessMode; 4] = [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::Create,
        AccessMode::Unlink,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Create => "create",
            AccessMode::Unlink => "unlink",
        }
    }

    /// Column name of the matching right in grant and rule tables.
    pub fn perm_column(self) -> &'static str {
        match self {
            AccessMode::Read => "perm_read",
            AccessMode::Write => "perm_write",
            AccessMode::Create => "perm_create",
            AccessMode::Unlink => "perm_unlink",
        }
    }
}

impl core::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "create" => Ok(AccessMode::Create),
            "unlink" => Ok(AccessMode::Unlink),
            other => Err(format!("unknown access mode '{other}'")),
        }
    }
}

/// One `(model, group)` grant of CRUD rights.
///
/// A grant without a group applies to every user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelGrant {
    pub name: String,
    pub model: String,
    pub group: Option<RecordId>,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub unlink: bool,
}

impl ModelGrant {
    pub fn allows(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
            AccessMode::Create => self.create,
            AccessMode::Unlink => self.unlink,
        }
    }
}

/// Record rule: a domain restricting which rows of a model a user may touch.
///
/// A rule without groups is global and applies to everybody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRule {
    pub id: RecordId,
    pub name: String,
    pub model: String,
    pub groups: Vec<RecordId>,
    /// Domain expression, evaluated with the user's attributes in scope.
    pub domain: String,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub unlink: bool,
    pub active: bool,
}

impl RecordRule {
    pub fn applies_to(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
            AccessMode::Create => self.create,
            AccessMode::Unlink => self.unlink,
        }
    }

    pub fn is_global(&self) -> bool {
        self.groups.is_empty()
    }
}
