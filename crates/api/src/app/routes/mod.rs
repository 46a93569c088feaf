use axum::{
    Router,
    routing::{get, post},
};

pub mod rpc;
pub mod system;

/// Router of the RPC endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/rpc", post(rpc::call))
        .route("/rpc/login", post(rpc::login))
        .route("/rpc/logout", post(rpc::logout))
        .route("/health", get(system::health))
        .route("/version", get(system::version))
}
