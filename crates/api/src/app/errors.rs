use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use strata_core::ErrorKind;

use crate::dispatch::RpcResponse;
use crate::error::RpcError;

/// HTTP status carried by an error response.
pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthError => StatusCode::UNAUTHORIZED,
        ErrorKind::AccessError => StatusCode::FORBIDDEN,
        ErrorKind::MissingError => StatusCode::NOT_FOUND,
        ErrorKind::ValidationError | ErrorKind::UserError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (status_of(self.kind), Json(json!({ "error": self }))).into_response()
    }
}

impl IntoResponse for RpcResponse {
    fn into_response(self) -> Response {
        let status = self
            .error
            .as_ref()
            .map(|e| status_of(e.kind))
            .unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}
