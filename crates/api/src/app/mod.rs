//! HTTP application wiring (Axum router + shared services).
//!
//! - `services.rs`: loader lock, sessions, call execution
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response bodies outside the RPC envelope
//! - `errors.rs`: error responses

use std::time::Duration;

use axum::{Extension, Router};
use tower::ServiceBuilder;
use tracing::debug;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: AppServices) -> Router {
    routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::request_id))
            .layer(Extension(services)),
    )
}

/// Purge expired sessions every `every` until the runtime shuts down.
pub fn spawn_session_reaper(services: AppServices, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            let purged = services.purge_sessions();
            if purged > 0 {
                debug!(purged, "expired sessions removed");
            }
        }
    })
}
