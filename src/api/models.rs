//! `GET /v1/models` — synthetic `auto` entry plus one per provider that has a
//! constructed backend (providers with no resolved API key are skipped, same
//! as `GET /health`).

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::app::App;

pub async fn list_models(State(app): State<Arc<App>>) -> impl IntoResponse {
    let config = app.config().await;

    let mut data = vec![json!({
        "id": "auto",
        "object": "model",
        "owned_by": "clawgate",
        "description": "routes through the layered routing engine",
    })];

    let mut names: Vec<&String> = app.providers.keys().collect();
    names.sort();
    for name in names {
        let Some(provider) = config.providers.get(name) else { continue };
        data.push(json!({
            "id": name,
            "object": "model",
            "owned_by": provider.dialect.to_string(),
            "description": format!("direct route to {name} ({})", provider.model),
        }));
    }

    Json(json!({ "object": "list", "data": data }))
}
