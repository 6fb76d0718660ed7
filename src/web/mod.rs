//! Admin and ingest HTTP API

mod api;

use crate::registry::SearchSync;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared sync context. Event handling and lookups take the read lock; only
/// enabling/disabling indices (`PUT /api/indices/{id}`) takes the write lock.
pub type AppState = Arc<RwLock<SearchSync>>;

/// Create the router with all API routes
pub fn create_router(sync: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api::health_handler))
        .route("/api/stats", get(api::stats_handler))
        .route("/api/indices", get(api::indices_handler))
        .route(
            "/api/indices/{id}",
            get(api::index_handler).put(api::update_index_handler),
        )
        .route("/api/indices/{id}/reindex", post(api::reindex_handler))
        .route("/api/events", post(api::events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(sync)
}
