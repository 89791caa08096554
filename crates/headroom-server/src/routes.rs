//! Route configuration.

use std::sync::Arc;

use axum::routing::{get, post, Router};
use headroom_core::UsageStore;
use tower_http::trace::TraceLayer;

use crate::handlers::{get_node, get_stats, health_check, list_nodes, submit_request};
use crate::state::AppState;

/// Create the HTTP router.
pub fn create_router<S: UsageStore>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/request", post(submit_request::<S>))
        .route("/health", get(health_check::<S>))
        .route("/nodes", get(list_nodes::<S>))
        .route("/nodes/{id}", get(get_node::<S>))
        .route("/stats", get(get_stats::<S>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
