//! Routing context extraction.
//!
//! A single pass over the incoming `messages` array produces an immutable
//! [`RoutingContext`] consumed by every layer of the engine (Design Notes §9,
//! "Context extraction").

use std::collections::HashMap;

use serde_json::Value;

/// Derived, read-only view of a single routing call's input.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Concatenation of every `role: system` message's text.
    pub system_prompt: String,
    /// Text of the last `role: user` message, or empty if none.
    pub last_user_message: String,
    /// Concatenation of every message's text, in order.
    pub full_text: String,
    /// `max(1, full_text.len() / 4)`.
    pub estimated_tokens: u64,
    /// Lowercased `model` field from the request, or `"auto"` if absent.
    pub model_requested: String,
    /// Whether the request carries a non-empty `tools` array.
    pub has_tools: bool,
    /// Lowercased `x-openclaw*` request headers, keyed by lowercased name.
    pub headers: HashMap<String, String>,
}

/// Extract the text contribution of a single message's `content` field.
///
/// Tolerates `content: null` (permitted by the OpenAI spec on tool-bearing
/// assistant turns — P3) and multimodal content arrays, whose `text` parts
/// are concatenated and whose non-text parts contribute nothing. Shared with
/// the provider dialect translators (`backends::google`, `backends::anthropic`),
/// which must apply the same flattening to outgoing request content.
pub(crate) fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| p.get("text").and_then(Value::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

impl RoutingContext {
    /// Build a routing context from the request body's `messages` array, the
    /// requested model string, a tool-presence flag, and the incoming HTTP
    /// headers (already filtered to the `x-openclaw` prefix by the caller).
    pub fn extract(
        messages: &[Value],
        model_requested: Option<&str>,
        has_tools: bool,
        headers: HashMap<String, String>,
    ) -> Self {
        let mut system_parts = Vec::new();
        let mut full_parts = Vec::new();
        let mut last_user_message = String::new();

        for msg in messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
            let text = extract_text(msg.get("content").unwrap_or(&Value::Null));

            if role == "system" {
                system_parts.push(text.clone());
            }
            if role == "user" {
                last_user_message = text.clone();
            }
            full_parts.push(text);
        }

        let system_prompt = system_parts.join(" ");
        let full_text = full_parts.join(" ");
        let estimated_tokens = (full_text.len() / 4).max(1) as u64;

        Self {
            system_prompt,
            last_user_message,
            full_text,
            estimated_tokens,
            model_requested: model_requested.unwrap_or("auto").to_lowercase(),
            has_tools,
            headers,
        }
    }
}

/// Filter and lowercase incoming request headers whose name starts with
/// `x-openclaw` (case-insensitive) — the only headers the routing engine
/// ever observes (spec §6).
pub fn openclaw_headers<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> HashMap<String, String> {
    headers
        .filter(|(name, _)| name.to_lowercase().starts_with("x-openclaw"))
        .map(|(name, value)| (name.to_lowercase(), value.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimated_tokens_is_four_chars_per_token_minimum_one() {
        let ctx = RoutingContext::extract(&[], None, false, HashMap::new());
        assert_eq!(ctx.estimated_tokens, 1);

        let messages = vec![json!({"role": "user", "content": "a".repeat(40)})];
        let ctx = RoutingContext::extract(&messages, None, false, HashMap::new());
        assert_eq!(ctx.estimated_tokens, 10);
    }

    #[test]
    fn system_prompt_excludes_user_and_assistant_text() {
        let messages = vec![
            json!({"role": "system", "content": "be concise"}),
            json!({"role": "user", "content": "hello there"}),
        ];
        let ctx = RoutingContext::extract(&messages, None, false, HashMap::new());
        assert_eq!(ctx.system_prompt, "be concise");
        assert_eq!(ctx.last_user_message, "hello there");
    }

    #[test]
    fn last_user_message_is_the_most_recent_user_turn() {
        let messages = vec![
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "reply"}),
            json!({"role": "user", "content": "second"}),
        ];
        let ctx = RoutingContext::extract(&messages, None, false, HashMap::new());
        assert_eq!(ctx.last_user_message, "second");
    }

    #[test]
    fn null_content_on_any_role_does_not_panic_and_yields_empty_text() {
        let messages = vec![
            json!({"role": "system", "content": null}),
            json!({"role": "user", "content": "ping"}),
            json!({"role": "assistant", "content": null, "tool_calls": [{"id": "x"}]}),
            json!({"role": "tool", "content": "result", "tool_call_id": "x"}),
            json!({"role": "user", "content": null}),
        ];
        let ctx = RoutingContext::extract(&messages, None, false, HashMap::new());
        assert_eq!(ctx.system_prompt, "");
        assert_eq!(ctx.last_user_message, "");
    }

    #[test]
    fn multimodal_content_array_flattens_text_parts_only() {
        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look at this"},
                {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}},
                {"type": "text", "text": "image"},
            ],
        })];
        let ctx = RoutingContext::extract(&messages, None, false, HashMap::new());
        assert_eq!(ctx.last_user_message, "look at thisimage");
    }

    #[test]
    fn model_requested_defaults_to_auto_and_is_lowercased() {
        let ctx = RoutingContext::extract(&[], Some("R1"), false, HashMap::new());
        assert_eq!(ctx.model_requested, "r1");
        let ctx = RoutingContext::extract(&[], None, false, HashMap::new());
        assert_eq!(ctx.model_requested, "auto");
    }

    #[test]
    fn openclaw_headers_filters_and_lowercases() {
        let raw = vec![
            ("X-OpenClaw-Source", "Subagent-42"),
            ("Content-Type", "application/json"),
        ];
        let filtered = openclaw_headers(raw.into_iter());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("x-openclaw-source").unwrap(), "subagent-42");
    }
}
