use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::server::{api_key_auth, AppState};
use crate::triggers::publish;

use super::health::{health, stats};
use super::metrics::prometheus_metrics;

/// Largest accepted publish body
const MAX_PUBLISH_BODY_BYTES: usize = 1024 * 1024;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Change publishing
        .nest(
            "/api/v1",
            Router::new()
                .route("/publish", post(publish))
                .layer(RequestBodyLimitLayer::new(MAX_PUBLISH_BODY_BYTES))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
