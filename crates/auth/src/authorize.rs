use std::collections::BTreeSet;

use serde::Serialize;
use strata_core::{OrmError, RecordId};
use thiserror::Error;
use tracing::debug;

use crate::{AccessMode, ModelGrant, Principal, RecordRule};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("you are not allowed to {mode} '{model}' records")]
    ModelDenied { model: String, mode: AccessMode },

    #[error("you are not allowed to access field '{field}' of '{model}'")]
    FieldDenied { model: String, field: String },
}

impl From<AuthzError> for OrmError {
    fn from(value: AuthzError) -> Self {
        OrmError::Access(value.to_string())
    }
}

/// Model-level check: some grant for `model` must allow `mode` to one of the
/// principal's groups (or to everybody). No grant at all means denied.
///
/// - No IO
/// - No panics
pub fn check_model_access(
    principal: &Principal,
    model: &str,
    mode: AccessMode,
    grants: &[ModelGrant],
) -> Result<(), AuthzError> {
    if principal.is_superuser() {
        return Ok(());
    }
    let granted = grants.iter().any(|g| {
        g.model == model
            && g.allows(mode)
            && g.group.is_none_or(|group| principal.in_group(group))
    });
    if granted {
        Ok(())
    } else {
        debug!(uid = principal.uid, model, mode = mode.as_str(), "model access denied");
        Err(AuthzError::ModelDenied {
            model: model.to_string(),
            mode,
        })
    }
}

/// Rules restricting `principal` on `model` for `mode`: active global rules
/// plus active rules sharing a group with the principal.
///
/// The superuser gets none.
pub fn applicable_rules<'a>(
    principal: &Principal,
    model: &str,
    mode: AccessMode,
    rules: &'a [RecordRule],
) -> Vec<&'a RecordRule> {
    if principal.is_superuser() {
        return Vec::new();
    }
    rules
        .iter()
        .filter(|r| r.active && r.model == model && r.applies_to(mode))
        .filter(|r| r.is_global() || principal.in_any(&r.groups))
        .collect()
}

/// Field visibility: fields without groups are visible to everybody.
pub fn check_field_access(
    principal: &Principal,
    model: &str,
    field: &str,
    groups: &[RecordId],
) -> Result<(), AuthzError> {
    if groups.is_empty() || principal.is_superuser() || principal.in_any(groups) {
        Ok(())
    } else {
        Err(AuthzError::FieldDenied {
            model: model.to_string(),
            field: field.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Detailed explanation of a model-level decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub model: String,
    pub mode: AccessMode,
    pub granted: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    pub principal: PrincipalState,
    /// Names of the grants that allow the operation to the principal.
    pub matching_grants: Vec<String>,
    /// Names of the record rules that will further restrict the rows.
    pub restricting_rules: Vec<String>,
    pub denial_reason: Option<DenialReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrincipalState {
    pub uid: RecordId,
    pub login: String,
    pub groups: Vec<RecordId>,
    pub superuser: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DenialReason {
    pub kind: DenialKind,
    pub message: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    NoGrant,
    GroupMismatch,
}

/// Explain why a model-level decision was (or would be) made.
///
/// Answers "why was this request allowed/denied?" and lists the record rules
/// that would then narrow the visible rows.
pub fn explain_authorization(
    principal: &Principal,
    model: &str,
    mode: AccessMode,
    grants: &[ModelGrant],
    rules: &[RecordRule],
) -> AuthorizationExplanation {
    let state = PrincipalState {
        uid: principal.uid,
        login: principal.login.clone(),
        groups: principal.groups.iter().copied().collect(),
        superuser: principal.is_superuser(),
    };
    let restricting_rules = applicable_rules(principal, model, mode, rules)
        .into_iter()
        .map(|r| r.name.clone())
        .collect();

    if principal.is_superuser() {
        return AuthorizationExplanation {
            model: model.to_string(),
            mode,
            granted: true,
            reason: "Superuser bypasses model grants and record rules".to_string(),
            principal: state,
            matching_grants: Vec::new(),
            restricting_rules,
            denial_reason: None,
        };
    }

    let for_model: Vec<&ModelGrant> = grants
        .iter()
        .filter(|g| g.model == model && g.allows(mode))
        .collect();
    let matching: Vec<String> = for_model
        .iter()
        .filter(|g| g.group.is_none_or(|group| principal.in_group(group)))
        .map(|g| g.name.clone())
        .collect();

    if !matching.is_empty() {
        return AuthorizationExplanation {
            model: model.to_string(),
            mode,
            granted: true,
            reason: format!("Granted by {}", matching.join(", ")),
            principal: state,
            matching_grants: matching,
            restricting_rules,
            denial_reason: None,
        };
    }

    let granting_groups: BTreeSet<RecordId> = for_model.iter().filter_map(|g| g.group).collect();
    let denial_reason = if granting_groups.is_empty() {
        DenialReason {
            kind: DenialKind::NoGrant,
            message: format!("No grant allows {mode} on '{model}'"),
            suggestions: vec![format!(
                "Add an access grant for '{model}' with the {mode} right"
            )],
        }
    } else {
        DenialReason {
            kind: DenialKind::GroupMismatch,
            message: format!(
                "{mode} on '{model}' is only granted to groups {:?}",
                granting_groups
            ),
            suggestions: vec![format!(
                "Add the user to one of the groups {:?}",
                granting_groups
            )],
        }
    };

    AuthorizationExplanation {
        model: model.to_string(),
        mode,
        granted: false,
        reason: denial_reason.message.clone(),
        principal: state,
        matching_grants: Vec::new(),
        restricting_rules,
        denial_reason: Some(denial_reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_USER: RecordId = 10;
    const GROUP_MANAGER: RecordId = 11;

    fn grant(group: Option<RecordId>, read: bool, write: bool) -> ModelGrant {
        ModelGrant {
            name: format!("access_doc_{group:?}"),
            model: "doc".into(),
            group,
            read,
            write,
            create: write,
            unlink: write,
        }
    }

    fn rule(name: &str, groups: Vec<RecordId>) -> RecordRule {
        RecordRule {
            id: 1,
            name: name.into(),
            model: "doc".into(),
            groups,
            domain: "[('user_id', '=', user.id)]".into(),
            read: true,
            write: true,
            create: true,
            unlink: true,
            active: true,
        }
    }

    #[test]
    fn read_only_grant_denies_write() {
        let u = Principal::new(5, "u").with_groups([GROUP_USER]);
        let grants = vec![grant(Some(GROUP_USER), true, false)];
        assert!(check_model_access(&u, "doc", AccessMode::Read, &grants).is_ok());
        assert_eq!(
            check_model_access(&u, "doc", AccessMode::Write, &grants),
            Err(AuthzError::ModelDenied {
                model: "doc".into(),
                mode: AccessMode::Write
            })
        );
    }

    #[test]
    fn absence_of_grants_denies_and_superuser_bypasses() {
        let u = Principal::new(5, "u");
        assert!(check_model_access(&u, "doc", AccessMode::Read, &[]).is_err());
        let root = Principal::new(strata_core::SUPERUSER_ID, "__system__");
        assert!(check_model_access(&root, "doc", AccessMode::Unlink, &[]).is_ok());
        let mut elevated = Principal::new(5, "u");
        elevated.su = true;
        assert!(check_model_access(&elevated, "doc", AccessMode::Unlink, &[]).is_ok());
    }

    #[test]
    fn rules_apply_when_global_or_group_shared() {
        let u = Principal::new(5, "u").with_groups([GROUP_USER]);
        let mut inactive = rule("inactive", vec![]);
        inactive.active = false;
        let rules = vec![
            rule("global", vec![]),
            rule("mine", vec![GROUP_USER]),
            rule("managers", vec![GROUP_MANAGER]),
            inactive,
        ];
        let names: Vec<_> = applicable_rules(&u, "doc", AccessMode::Read, &rules)
            .into_iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["global", "mine"]);
    }

    #[test]
    fn hidden_fields_need_a_group() {
        let u = Principal::new(5, "u").with_groups([GROUP_USER]);
        assert!(check_field_access(&u, "doc", "x", &[]).is_ok());
        assert!(check_field_access(&u, "doc", "x", &[GROUP_USER]).is_ok());
        assert!(check_field_access(&u, "doc", "x", &[GROUP_MANAGER]).is_err());
    }

    #[test]
    fn explanation_names_missing_groups() {
        let u = Principal::new(5, "u");
        let grants = vec![grant(Some(GROUP_MANAGER), true, true)];
        let explanation = explain_authorization(&u, "doc", AccessMode::Write, &grants, &[]);
        assert!(!explanation.granted);
        let reason = explanation.denial_reason.unwrap();
        assert_eq!(reason.kind, DenialKind::GroupMismatch);

        let explanation = explain_authorization(
            &u.clone().with_groups([GROUP_MANAGER]),
            "doc",
            AccessMode::Write,
            &grants,
            &[rule("global", vec![])],
        );
        assert!(explanation.granted);
        assert_eq!(explanation.restricting_rules, vec!["global".to_string()]);
    }
}
