use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::app::dto::{LoginRequest, LoginResponse, LogoutRequest};
use crate::app::services::AppServices;
use crate::dispatch::{RpcRequest, RpcResponse};
use crate::error::RpcError;

pub async fn call(
    Extension(services): Extension<AppServices>,
    body: Result<Json<RpcRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => services.call(request).await.into_response(),
        Err(rejection) => RpcResponse::err(None, RpcError::bad_request(rejection.body_text())).into_response(),
    }
}

pub async fn login(
    Extension(services): Extension<AppServices>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return RpcError::bad_request(rejection.body_text()).into_response(),
    };
    match services.login(&req.db, &req.login, &req.password).await {
        Ok(session) => Json(LoginResponse {
            session: session.id,
            uid: session.uid,
            expires_at: session.expires_at.to_rfc3339(),
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn logout(
    Extension(services): Extension<AppServices>,
    body: Result<Json<LogoutRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => Json(json!({ "result": services.logout(&req.session) })).into_response(),
        Err(rejection) => RpcError::bad_request(rejection.body_text()).into_response(),
    }
}
