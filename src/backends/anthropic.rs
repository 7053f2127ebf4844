//! Anthropic Messages API dialect.
//!
//! Translates between the OpenAI chat completions schema (used internally
//! everywhere else in this crate) and Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) API.
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |
//! | Cache accounting | `usage.prompt_cache_hit_tokens` | `usage.cache_read_input_tokens` |

use reqwest::header;
use serde_json::{json, Value};

use super::openai::{classify_reqwest_error, round1};
use super::{ProviderBackend, ProviderError};
use crate::routing::context::extract_text;

/// Default `max_tokens` when the caller omits it. Anthropic requires the
/// field; this is a sensible ceiling for ordinary conversational use.
const DEFAULT_MAX_TOKENS: u64 = 8_192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(super) fn build_headers(api_key: &str) -> header::HeaderMap {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        "x-api-key",
        header::HeaderValue::from_str(api_key).expect("Anthropic API key contains invalid header bytes"),
    );
    headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));
    headers
}

pub(super) async fn complete(backend: &ProviderBackend, body: Value) -> Result<Value, ProviderError> {
    let request = to_anthropic(&body, &backend.model, backend.max_tokens).map_err(|e| ProviderError::Other {
        provider: backend.name.clone(),
        detail: e.to_string(),
    })?;

    let url = format!("{}/v1/messages", backend.base_url);
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

    let resp: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Other {
        provider: backend.name.clone(),
        detail: format!("invalid JSON response: {e}"),
    })?;

    let mut out = from_anthropic(resp).map_err(|e| ProviderError::Other {
        provider: backend.name.clone(),
        detail: e.to_string(),
    })?;

    let cache_hit = out["usage"]["cache_read_tokens"].as_u64().unwrap_or(0);
    let cache_miss = out["usage"]["cache_write_tokens"].as_u64().unwrap_or(0);
    out["_clawgate"] = json!({
        "provider": backend.name,
        "model": backend.model,
        "latency_ms": round1(latency_ms),
        "cache_hit_tokens": cache_hit,
        "cache_miss_tokens": cache_miss,
    });

    Ok(out)
}

pub(super) async fn health_check(backend: &ProviderBackend) -> Result<(), ProviderError> {
    let probe = json!({
        "model": backend.model,
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "ping" }],
    });

    let url = format!("{}/v1/messages", backend.base_url);
    let response = backend
        .client
        .post(&url)
        .json(&probe)
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

/// Convert an OpenAI chat completions request to the Anthropic Messages
/// format. `model` and `default_max_tokens` come from the configured
/// backend, not the caller's request body — the backend's model always wins.
pub(crate) fn to_anthropic(request: &Value, model: &str, default_max_tokens: u64) -> anyhow::Result<Value> {
    let max_tokens = request["max_tokens"].as_u64().unwrap_or(default_max_tokens);

    let raw_messages = request["messages"].as_array().ok_or_else(|| anyhow::anyhow!("`messages` array is required"))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        let role = msg["role"].as_str().unwrap_or("user");
        let text = extract_text(msg.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system_parts.push(text);
        } else {
            messages.push(json!({ "role": role, "content": text }));
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }

    Ok(req)
}

/// Convert an Anthropic Messages API response to the OpenAI chat completions
/// schema, including Anthropic's prompt-caching token counts.
pub(crate) fn from_anthropic(resp: Value) -> anyhow::Result<Value> {
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| anyhow::anyhow!("no text block in Anthropic response `content` array"))?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown");

    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        other => other,
    };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);
    let cache_read_tokens = resp["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0);
    let cache_write_tokens = resp["usage"]["cache_creation_input_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
            "cache_read_tokens": cache_read_tokens,
            "cache_write_tokens": cache_write_tokens,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn to_anthropic_extracts_system_message_to_top_level() {
        let req = json!({
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();

        assert_eq!(out["system"], "You are a helpful assistant.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1, "system message should be removed from messages array");
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn to_anthropic_concatenates_multiple_system_messages() {
        let req = json!({
            "messages": [
                { "role": "system", "content": "Part one." },
                { "role": "system", "content": "Part two." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["system"], "Part one.\n\nPart two.");
    }

    #[test]
    fn to_anthropic_defaults_max_tokens_when_absent() {
        let req = json!({ "messages": [{ "role": "user", "content": "Hi" }] });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn to_anthropic_uses_caller_max_tokens() {
        let req = json!({ "max_tokens": 256, "messages": [{ "role": "user", "content": "Hi" }] });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["max_tokens"], 256);
    }

    #[test]
    fn to_anthropic_forwards_temperature() {
        let req = json!({ "messages": [{ "role": "user", "content": "Hi" }], "temperature": 0.3 });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert!((out["temperature"].as_f64().unwrap() - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn to_anthropic_always_uses_the_backend_model() {
        let req = json!({ "model": "gpt-4", "messages": [{ "role": "user", "content": "Hi" }] });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["model"], "claude-haiku-4-5-20251001");
    }

    #[test]
    fn to_anthropic_flattens_null_content_on_any_role() {
        let req = json!({
            "messages": [
                { "role": "system", "content": null },
                { "role": "user", "content": "ping" },
                { "role": "assistant", "content": null, "tool_calls": [{ "id": "x" }] },
                { "role": "user", "content": null },
            ],
        });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["system"], "");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"], "ping");
        assert_eq!(messages[1]["content"], "");
        assert_eq!(messages[2]["content"], "");
    }

    #[test]
    fn to_anthropic_flattens_multimodal_content_array() {
        let req = json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "look at this" },
                    { "type": "image_url", "image_url": { "url": "https://example.com/x.png" } },
                    { "type": "text", "text": "image" },
                ],
            }],
        });
        let out = to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).unwrap();
        assert_eq!(out["messages"][0]["content"], "look at thisimage");
    }

    #[test]
    fn to_anthropic_errors_without_messages() {
        let req = json!({});
        assert!(to_anthropic(&req, "claude-haiku-4-5-20251001", DEFAULT_MAX_TOKENS).is_err());
    }

    #[test]
    fn from_anthropic_maps_end_turn_to_stop() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(resp).unwrap();

        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
        assert_eq!(out["usage"]["completion_tokens"], 5);
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn from_anthropic_maps_max_tokens_stop_reason_to_length() {
        let resp = json!({
            "id": "msg_456",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "text", "text": "…" }],
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 100, "output_tokens": 1024 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn from_anthropic_extracts_cache_token_counts() {
        let resp = json!({
            "id": "msg_789",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "text", "text": "hi" }],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 10,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20,
            },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["usage"]["cache_read_tokens"], 80);
        assert_eq!(out["usage"]["cache_write_tokens"], 20);
    }

    #[test]
    fn from_anthropic_errors_when_no_text_block_present() {
        let resp = json!({
            "id": "msg_789",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "tool_use", "id": "toolu_1", "name": "calculator", "input": {} }],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        assert!(from_anthropic(resp).is_err());
    }

    #[test]
    fn from_anthropic_preserves_message_id() {
        let resp = json!({
            "id": "msg_abc",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "text", "text": "Hi" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 1, "output_tokens": 1 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["id"], "msg_abc");
    }
}
