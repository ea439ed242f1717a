//! Unified API router for calsync.
//!
//! Mounts all endpoint groups under /v1/:
//! - /v1/credentials — Provider credential registration and revocation
//! - /v1/watch       — Watch channel lifecycle (create/renew, stop)
//! - /v1/sync        — On-demand incremental sync
//! - /v1/events      — Mirror record queries and task linking
//! - /v1/webhooks    — Provider push notification ingress
//! - /v1/status      — Health check

pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/v1", routes::v1_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
