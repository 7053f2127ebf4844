//! `POST /v1/chat/completions` — the gateway's one load-bearing endpoint.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    app::App,
    dispatcher::{self, DispatchResult},
    routing::{context::openclaw_headers, RoutingEngine},
};

/// `POST /v1/chat/completions`.
///
/// `model=auto` (or absent) runs the full routing engine; any `model` that
/// exactly names a configured provider bypasses the engine entirely
/// (`layer=direct`).
pub async fn chat_completions(State(app): State<Arc<App>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let config = app.config().await;

    let messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let model_requested = body.get("model").and_then(Value::as_str);
    let has_tools = body.get("tools").and_then(Value::as_array).is_some_and(|t| !t.is_empty());
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let direct_target = model_requested
        .filter(|m| *m != "auto")
        .filter(|m| config.providers.contains_key(*m));

    let decision = if let Some(name) = direct_target {
        RoutingEngine::direct_decision(name)
    } else {
        let header_pairs = headers.iter().filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
        let openclaw = openclaw_headers(header_pairs);
        let provider_health = app.health.snapshot_all().await;
        app.routing.route(&config, &messages, model_requested, has_tools, openclaw, &provider_health).await
    };

    match dispatcher::dispatch(&app, &decision, body, stream).await {
        Ok(DispatchResult::Complete { body, provider }) => {
            let mut response = (StatusCode::OK, Json(body)).into_response();
            attach_routing_headers(&mut response, &provider, decision.layer.to_string().as_str(), &decision.rule_name);
            response
        }
        Ok(DispatchResult::Stream { stream, provider }) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .expect("building a streaming response cannot fail");
            if let Ok(v) = HeaderValue::from_str(&provider) {
                response.headers_mut().insert("x-clawgate-provider", v);
            }
            response
        }
        Err(errors) => {
            let attempts: Vec<Value> = errors
                .iter()
                .map(|e| json!({ "provider": e.provider(), "detail": e.to_string() }))
                .collect();
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": {
                        "message": "all upstream attempts failed",
                        "type": "provider_error",
                        "attempts": attempts,
                    }
                })),
            )
                .into_response()
        }
    }
}

fn attach_routing_headers(response: &mut Response, provider: &str, layer: &str, rule_name: &str) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(provider) {
        headers.insert("x-clawgate-provider", v);
    }
    if let Ok(v) = HeaderValue::from_str(layer) {
        headers.insert("x-clawgate-layer", v);
    }
    if let Ok(v) = HeaderValue::from_str(rule_name) {
        headers.insert("x-clawgate-rule", v);
    }
}
