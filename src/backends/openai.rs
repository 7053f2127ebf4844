//! OpenAI-compatible dialect — DeepSeek, OpenRouter, LM Studio, vLLM, and most
//! self-hosted servers. The request body is forwarded with only `model` and
//! `max_tokens` rewritten; no schema translation is performed.

use futures_util::StreamExt as _;
use reqwest::header;
use serde_json::{json, Value};

use super::{ProviderBackend, ProviderError, SseStream};

/// Build the default headers for an OpenAI-compatible client: a bearer token,
/// plus the extra headers OpenRouter expects when `base_url` names it.
pub(super) fn build_headers(api_key: &str, base_url: &str) -> header::HeaderMap {
    let mut headers = header::HeaderMap::new();
    if !api_key.is_empty() {
        let value = format!("Bearer {api_key}");
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value).expect("API key contains invalid header bytes"),
        );
    }
    if base_url.contains("openrouter") {
        headers.insert("HTTP-Referer", header::HeaderValue::from_static("https://clawgate.local"));
        headers.insert("X-Title", header::HeaderValue::from_static("ClawGate"));
    }
    headers
}

fn prepare_body(backend: &ProviderBackend, mut body: Value, stream: bool) -> Value {
    body["model"] = json!(backend.model);
    if body.get("max_tokens").and_then(Value::as_u64).is_none() {
        body["max_tokens"] = json!(backend.max_tokens);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

pub(super) async fn complete(backend: &ProviderBackend, body: Value, stream: bool) -> Result<Value, ProviderError> {
    let body = prepare_body(backend, body, stream);
    let url = format!("{}/chat/completions", backend.base_url);

    let t0 = std::time::Instant::now();
    let response = backend
        .client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&backend.name, e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::Other { provider: backend.name.clone(), detail: e.to_string() })?;
    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;

    if status.as_u16() >= 400 {
        return Err(ProviderError::Http {
            provider: backend.name.clone(),
            status: status.as_u16(),
            detail: text.chars().take(500).collect(),
        });
    }

    let mut data: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Other {
        provider: backend.name.clone(),
        detail: format!("invalid JSON response: {e}"),
    })?;

    let usage = data.get("usage").cloned().unwrap_or_else(|| json!({}));
    let cache_hit = usage.get("prompt_cache_hit_tokens").and_then(Value::as_u64).unwrap_or(0);
    let cache_miss = usage.get("prompt_cache_miss_tokens").and_then(Value::as_u64).unwrap_or(0);

    data["_clawgate"] = json!({
        "provider": backend.name,
        "model": backend.model,
        "latency_ms": round1(latency_ms),
        "cache_hit_tokens": cache_hit,
        "cache_miss_tokens": cache_miss,
    });

    Ok(data)
}

pub(super) async fn complete_stream(backend: &ProviderBackend, body: Value) -> Result<SseStream, ProviderError> {
    let body = prepare_body(backend, body, true);
    let url = format!("{}/chat/completions", backend.base_url);

    let response = backend
        .stream_client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&backend.name, e))?;
    let status = response.status();
    if status.as_u16() >= 400 {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            provider: backend.name.clone(),
            status: status.as_u16(),
            detail: text.chars().take(500).collect(),
        });
    }

    let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
    Ok(Box::pin(stream))
}

pub(super) async fn health_check(backend: &ProviderBackend) -> Result<(), ProviderError> {
    let url = format!("{}/models", backend.base_url);
    let response = backend
        .client
        .get(&url)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&backend.name, e))?;

    if !response.status().is_success() {
        return Err(ProviderError::Http {
            provider: backend.name.clone(),
            status: response.status().as_u16(),
            detail: "health check failed".into(),
        });
    }
    Ok(())
}

pub(super) fn classify_reqwest_error(provider: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { provider: provider.to_string() }
    } else if e.is_connect() {
        ProviderError::Connection { provider: provider.to_string(), detail: e.to_string() }
    } else {
        ProviderError::Other { provider: provider.to_string(), detail: e.to_string() }
    }
}

pub(super) fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
