use std::collections::BTreeSet;

use strata_auth::AccessMode;
use strata_core::{OrmError, OrmResult, RecordId};

use super::RecordSet;
use crate::compiler;
use crate::domain::{Domain, Operator};
use crate::field::Field;

impl RecordSet {
    /// Fail unless the user holds `mode` on the model.
    pub fn check_access(&self, mode: AccessMode) -> OrmResult<()> {
        if self.env.is_superuser() {
            return Ok(());
        }
        self.env
            .registry()
            .policy()
            .check_model(&self.env, &self.model.name, mode)
    }

    /// Record-rule domain for `mode`; always true in superuser mode.
    pub fn rule_domain(&self, mode: AccessMode) -> OrmResult<Domain> {
        if self.env.is_superuser() {
            return Ok(Domain::True);
        }
        self.env
            .registry()
            .policy()
            .rule_domain(&self.env, &self.model.name, mode)
    }

    /// Fail unless every record passes the record rules of `mode`.
    ///
    /// Records hidden from reading are reported missing; for other modes the
    /// failure is an access error.
    pub fn check_rules(&self, mode: AccessMode) -> OrmResult<()> {
        if self.ids.is_empty() {
            return Ok(());
        }
        let rule = self.rule_domain(mode)?;
        if rule.is_true() {
            return Ok(());
        }
        let ids: BTreeSet<RecordId> = self.ids.iter().copied().collect();
        let scoped = Domain::and([
            Domain::leaf("id", Operator::In, ids.iter().copied().collect::<Vec<_>>()),
            rule,
        ]);
        let allowed: BTreeSet<RecordId> = compiler::search_ids(&self.env, &self.model, &scoped)?
            .into_iter()
            .collect();
        let denied: Vec<RecordId> = ids.difference(&allowed).copied().collect();
        if denied.is_empty() {
            return Ok(());
        }
        let msg = format!(
            "{} operation on {}{:?} is not allowed by record rules",
            mode, self.model.name, denied
        );
        Err(match mode {
            AccessMode::Read => OrmError::missing(msg),
            _ => OrmError::access(msg),
        })
    }

    /// Whether the user may see `field` (field groups).
    pub fn field_visible(&self, field: &Field) -> OrmResult<bool> {
        if field.groups.is_empty() || self.env.is_superuser() {
            return Ok(true);
        }
        let policy = self.env.registry().policy();
        for group in &field.groups {
            if policy.has_group(&self.env, group)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fail if the user may not see `field`; filtering, grouping or
    /// aggregating on it would reveal its values.
    pub(crate) fn check_field_readable(&self, field: &Field) -> OrmResult<()> {
        if self.field_visible(field)? {
            Ok(())
        } else {
            Err(OrmError::access(format!(
                "field '{}' of {} is restricted to other groups",
                field.name, self.model.name
            )))
        }
    }

    /// [`check_field_readable`](Self::check_field_readable) for every field
    /// crossed by the leaves of `domain`. Unknown fields are left to the
    /// domain compiler.
    pub(crate) fn check_domain_readable(&self, domain: &Domain) -> OrmResult<()> {
        if self.env.is_superuser() {
            return Ok(());
        }
        for path in domain.paths() {
            let mut current = self.model.clone();
            for seg in path.split('.') {
                let Ok(field) = current.field(seg) else { break };
                let records = self.env.browse(&current.name, Vec::<RecordId>::new())?;
                records.check_field_readable(field)?;
                let Some(comodel) = field.comodel().map(str::to_string) else { break };
                current = self.env.get_model(&comodel)?;
            }
        }
        Ok(())
    }

    pub(crate) fn check_field_writable(&self, field: &Field) -> OrmResult<()> {
        if self.field_visible(field)? {
            Ok(())
        } else {
            Err(OrmError::access(format!(
                "field '{}' of {} is restricted to other groups",
                field.name, self.model.name
            )))
        }
    }

    /// Fail with a missing error unless every record exists.
    pub(crate) fn check_exists(&self) -> OrmResult<()> {
        let mut missing = Vec::new();
        for id in &self.ids {
            if !self.env.with_cursor(|cr| cr.exists(&self.model.table, *id))? {
                missing.push(*id);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrmError::missing(format!(
                "records {}{:?} do not exist or have been deleted",
                self.model.name, missing
            )))
        }
    }
}
