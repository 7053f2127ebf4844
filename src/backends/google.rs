//! Google GenAI dialect — `models/{model}:generateContent`.
//!
//! OpenAI messages are translated to Google's `contents`/`systemInstruction`
//! shape on the way in, and `candidates[0].content.parts` is flattened back to
//! a single assistant message on the way out. The API key travels as a query
//! parameter rather than a header.

use serde_json::{json, Value};

use super::openai::{classify_reqwest_error, round1};
use super::{ProviderBackend, ProviderError};
use crate::routing::context::extract_text;

pub(super) async fn complete(backend: &ProviderBackend, body: Value) -> Result<Value, ProviderError> {
    let request = to_google(backend, &body);

    let url = format!("{}/models/{}:generateContent?key={}", backend.base_url, backend.model, backend.api_key);
    let t0 = std::time::Instant::now();
    let response = backend
        .client
        .post(&url)
        .json(&request)
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

    let data: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Other {
        provider: backend.name.clone(),
        detail: format!("invalid JSON response: {e}"),
    })?;

    Ok(from_google(&backend.name, &backend.model, &data, latency_ms))
}

pub(super) async fn health_check(backend: &ProviderBackend) -> Result<(), ProviderError> {
    let url = format!("{}/models?key={}", backend.base_url, backend.api_key);
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

fn to_google(backend: &ProviderBackend, body: &Value) -> Value {
    let mut contents = Vec::new();
    let mut system_instruction: Option<String> = None;

    for msg in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = extract_text(msg.get("content").unwrap_or(&Value::Null));
        match role {
            "system" => system_instruction = Some(text),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut request = json!({ "contents": contents });
    if let Some(sys) = system_instruction {
        request["systemInstruction"] = json!({ "parts": [{"text": sys}] });
    }

    let max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(backend.max_tokens);
    let mut gen_config = serde_json::Map::new();
    gen_config.insert("maxOutputTokens".into(), json!(max_tokens));
    if let Some(temp) = body.get("temperature").and_then(Value::as_f64) {
        gen_config.insert("temperature".into(), json!(temp));
    }
    request["generationConfig"] = Value::Object(gen_config);

    request
}

fn from_google(provider: &str, model: &str, data: &Value, latency_ms: f64) -> Value {
    let content = data
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| parts.iter().map(|p| p.get("text").and_then(Value::as_str).unwrap_or("")).collect::<Vec<_>>().join(""))
        .unwrap_or_default();

    let usage_meta = data.get("usageMetadata").cloned().unwrap_or_else(|| json!({}));
    let prompt_tokens = usage_meta.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
    let completion_tokens = usage_meta.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
    let total_tokens = usage_meta.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(prompt_tokens + completion_tokens);
    let cached = usage_meta.get("cachedContentTokenCount").and_then(Value::as_u64).unwrap_or(0);

    let now = chrono::Utc::now().timestamp();

    json!({
        "id": format!("clawgate-google-{now}"),
        "object": "chat.completion",
        "created": now,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": total_tokens,
        },
        "_clawgate": {
            "provider": provider,
            "model": model,
            "latency_ms": round1(latency_ms),
            "cache_hit_tokens": cached,
            "cache_miss_tokens": prompt_tokens.saturating_sub(cached),
        },
    })
}
