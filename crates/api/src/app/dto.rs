use serde::{Deserialize, Serialize};
use strata_core::RecordId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub db: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub session: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub session: String,
    pub uid: RecordId,
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub server_version: &'static str,
    pub protocol_version: u32,
    pub db: String,
    pub modules: Vec<String>,
}
