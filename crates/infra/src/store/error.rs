use strata_core::{OrmError, RecordId};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Cursor-level failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("column {table}.{column} expects {expected}, got {found}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        found: String,
    },

    #[error("null value in column {table}.{column} violates not-null constraint")]
    NotNull { table: String, column: String },

    #[error("duplicate key violates unique constraint '{constraint}' on table '{table}'")]
    UniqueViolation { table: String, constraint: String },

    #[error("{table}.{column} references missing row {id} of '{target}'")]
    ForeignKeyViolation {
        table: String,
        column: String,
        target: String,
        id: RecordId,
    },

    #[error("row {id} of '{table}' is still referenced by {referencing_table}.{column}")]
    Restricted {
        table: String,
        id: RecordId,
        referencing_table: String,
        column: String,
    },

    #[error("row {id} of '{table}' does not exist")]
    MissingRow { table: String, id: RecordId },

    /// A concurrent transaction committed a conflicting change first.
    #[error("could not serialize access: {0}")]
    SerializationConflict(String),

    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    #[error("transaction is aborted")]
    Aborted,

    #[error("invalid schema change: {0}")]
    Schema(String),

    #[error("snapshot failure: {0}")]
    Snapshot(String),
}

impl From<StoreError> for OrmError {
    fn from(value: StoreError) -> Self {
        let msg = value.to_string();
        match value {
            StoreError::TypeMismatch { .. } | StoreError::NotNull { .. } => OrmError::Validation(msg),
            StoreError::UniqueViolation { .. }
            | StoreError::ForeignKeyViolation { .. }
            | StoreError::Restricted { .. } => OrmError::Integrity(msg),
            StoreError::MissingRow { .. } => OrmError::Missing(msg),
            StoreError::SerializationConflict(_) => OrmError::Concurrency(msg),
            StoreError::DeadlineExceeded | StoreError::Aborted => OrmError::Timeout(msg),
            StoreError::UnknownTable(_)
            | StoreError::UnknownColumn { .. }
            | StoreError::Schema(_)
            | StoreError::Snapshot(_) => OrmError::Internal(msg),
        }
    }
}
