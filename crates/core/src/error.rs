//! ORM error model.

use serde::Serialize;
use thiserror::Error;

/// Result type used across the ORM layers.
pub type OrmResult<T> = Result<T, OrmError>;

/// Error raised by model operations.
///
/// Business code may catch and recover from any of these; the RPC boundary
/// rolls the transaction back and maps them to a wire [`ErrorKind`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrmError {
    /// A constraint (required field, check constraint, invariant) rejected a write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The current user lacks rights on a model, record or field.
    #[error("access denied: {0}")]
    Access(String),

    /// A referenced record does not exist or is filtered out by a rule.
    #[error("missing record: {0}")]
    Missing(String),

    /// A business-rule rejection intended for end-user display.
    #[error("{0}")]
    User(String),

    /// Cursor-level constraint violation (unique, foreign key, not null).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Schema lookup failure for a model name.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Schema lookup failure for a field name.
    #[error("unknown field '{field}' on model '{model}'")]
    UnknownField { model: String, field: String },

    /// A concurrent transaction committed a conflicting write first.
    #[error("concurrent update: {0}")]
    Concurrency(String),

    /// The call deadline expired; the transaction is aborted.
    #[error("transaction aborted: {0}")]
    Timeout(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn access(msg: impl Into<String>) -> Self {
        Self::Access(msg.into())
    }

    pub fn missing(msg: impl Into<String>) -> Self {
        Self::Missing(msg.into())
    }

    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel(model.into())
    }

    pub fn unknown_field(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            model: model.into(),
            field: field.into(),
        }
    }

    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrmError::Validation(_) | OrmError::Integrity(_) => ErrorKind::ValidationError,
            OrmError::Access(_) => ErrorKind::AccessError,
            OrmError::Missing(_) | OrmError::UnknownModel(_) | OrmError::UnknownField { .. } => {
                ErrorKind::MissingError
            }
            OrmError::User(_) => ErrorKind::UserError,
            OrmError::Concurrency(_) | OrmError::Timeout(_) | OrmError::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// Whether retrying the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrmError::Concurrency(_))
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(value: serde_json::Error) -> Self {
        OrmError::Validation(format!("malformed value: {value}"))
    }
}

/// Error kinds exposed by the RPC wire protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    AuthError,
    AccessError,
    ValidationError,
    MissingError,
    UserError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthError => "AuthError",
            ErrorKind::AccessError => "AccessError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::MissingError => "MissingError",
            ErrorKind::UserError => "UserError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_surfaces_as_validation_on_the_wire() {
        assert_eq!(
            OrmError::integrity("duplicate key").kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn schema_lookups_surface_as_missing() {
        assert_eq!(OrmError::unknown_model("x").kind(), ErrorKind::MissingError);
        assert_eq!(
            OrmError::unknown_field("x", "y").kind(),
            ErrorKind::MissingError
        );
    }

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(OrmError::Concurrency("row 3".into()).is_retryable());
        assert!(!OrmError::internal("boom").is_retryable());
    }
}
