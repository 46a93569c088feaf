//! `strata-auth`: pure authentication/authorization decisions.
//!
//! This crate is intentionally decoupled from HTTP and storage: callers load
//! grants, rules and group memberships and hand them in.

pub mod authorize;
pub mod password;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod session;

pub use authorize::{
    AuthorizationExplanation, AuthzError, applicable_rules, check_field_access,
    check_model_access, explain_authorization,
};
pub use password::{hash_password, verify_password};
pub use permissions::{AccessMode, ModelGrant, RecordRule};
pub use principal::Principal;
pub use roles::GroupGraph;
pub use session::{AuthError, InMemorySessionStore, Session, SessionStore};
