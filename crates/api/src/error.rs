//! Wire errors of the RPC protocol.

use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use strata_auth::AuthError;
use strata_core::{ErrorKind, OrmError};
use strata_loader::LoadError;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// `{kind, message, data}` as returned in the `error` member of a response.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: JsonValue,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: JsonValue::Null,
        }
    }

    pub fn auth(err: &AuthError) -> Self {
        Self::new(ErrorKind::AuthError, err.to_string())
    }

    /// Request that could not be decoded.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Internal failure: the details go to the log under a fresh correlation
    /// id, the caller only sees the id.
    pub fn internal(detail: &dyn std::fmt::Display, retryable: bool) -> Self {
        let correlation_id = Uuid::now_v7().to_string();
        error!(%correlation_id, error = %detail, "internal error");
        let mut data = json!({ "correlation_id": correlation_id });
        if retryable {
            data["retryable"] = json!(true);
        }
        Self {
            kind: ErrorKind::InternalError,
            message: "internal server error".to_string(),
            data,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.data.get("correlation_id").and_then(JsonValue::as_str)
    }

    pub fn is_retryable(&self) -> bool {
        self.data.get("retryable").and_then(JsonValue::as_bool).unwrap_or(false)
    }
}

impl From<OrmError> for RpcError {
    fn from(err: OrmError) -> Self {
        match err.kind() {
            ErrorKind::InternalError => RpcError::internal(&err, err.is_retryable()),
            kind => {
                let message = match &err {
                    OrmError::User(msg) => msg.clone(),
                    other => other.to_string(),
                };
                RpcError::new(kind, message)
            }
        }
    }
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        RpcError::auth(&err)
    }
}

impl From<LoadError> for RpcError {
    fn from(err: LoadError) -> Self {
        RpcError::from(OrmError::from(err))
    }
}
