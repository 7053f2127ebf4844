//! HTTP surface: route table and shared middleware.

pub mod chat;
pub mod health;
pub mod models;
pub mod request_id;
pub mod stats;

use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::App;

/// Build the single-port router: chat/models/health are the public surface,
/// `/api/*` is the durable metrics readback.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/health", get(health::health))
        .route("/api/stats", get(stats::stats))
        .route("/api/recent", get(stats::recent))
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(300)))
        .with_state(app)
}
