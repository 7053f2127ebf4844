//! `GET /health` — per-provider health snapshot.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::app::App;

/// `GET /health` — `{status:"ok", providers:{name → health_dict}}`.
pub async fn health(State(app): State<Arc<App>>) -> impl IntoResponse {
    let providers = app.health.snapshot_all().await;
    Json(json!({ "status": "ok", "providers": providers }))
}
