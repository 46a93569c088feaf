//! Access-control seam consulted by recordset operations.

use std::collections::BTreeSet;
use std::fmt;

use strata_auth::AccessMode;
use strata_core::{OrmResult, RecordId};

use crate::domain::Domain;
use crate::env::Env;

/// Decides model-level rights and record-rule domains for the env's user.
///
/// Recordsets never call the policy for a superuser env.
pub trait AccessPolicy: Send + Sync {
    /// Fail with an access error unless the user holds `mode` on `model`.
    fn check_model(&self, env: &Env, model: &str, mode: AccessMode) -> OrmResult<()>;

    /// Conjunction of the record rules that apply to the user; `Domain::True` when none.
    fn rule_domain(&self, env: &Env, model: &str, mode: AccessMode) -> OrmResult<Domain>;

    /// Effective groups of the user, implied groups included.
    fn user_groups(&self, env: &Env) -> OrmResult<BTreeSet<RecordId>>;

    /// Whether the user belongs to the group with external id `xmlid`.
    fn has_group(&self, env: &Env, xmlid: &str) -> OrmResult<bool>;
}

/// Policy granting everything; used by registries built without the base addon.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check_model(&self, _env: &Env, _model: &str, _mode: AccessMode) -> OrmResult<()> {
        Ok(())
    }

    fn rule_domain(&self, _env: &Env, _model: &str, _mode: AccessMode) -> OrmResult<Domain> {
        Ok(Domain::True)
    }

    fn user_groups(&self, _env: &Env) -> OrmResult<BTreeSet<RecordId>> {
        Ok(BTreeSet::new())
    }

    fn has_group(&self, _env: &Env, _xmlid: &str) -> OrmResult<bool> {
        Ok(true)
    }
}

impl fmt::Debug for dyn AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessPolicy")
    }
}
