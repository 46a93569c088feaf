use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use crate::app::dto::VersionInfo;
use crate::app::services::AppServices;
use crate::error::RpcError;

/// Wire protocol revision reported by `/version`.
pub const PROTOCOL_VERSION: u32 = 1;

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

pub async fn version(Extension(services): Extension<AppServices>) -> Result<Json<VersionInfo>, RpcError> {
    Ok(Json(VersionInfo {
        server_version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        db: services.db_name().to_string(),
        modules: services.installed_modules().await?,
    }))
}
