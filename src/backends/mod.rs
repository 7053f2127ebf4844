//! Provider backend dispatch.
//!
//! [`ProviderBackend`] is a single struct carrying a `dialect` tag, mirroring
//! the original gateway's unified `ProviderBackend` class rather than the
//! enum-of-adapters split some gateways use. Dialect-specific request/response
//! translation lives in the sibling `openai`/`google`/`anthropic` modules as
//! free functions; this module only dispatches and owns the HTTP clients.

pub mod health;

mod anthropic;
mod google;
mod openai;

use std::{pin::Pin, time::Duration};

use bytes::Bytes;
use futures_util::Stream;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::config::{Dialect, ProviderConfig};

/// A `Send`-able, heap-allocated SSE byte stream forwarded to the client.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Errors a provider call can fail with. Every attempt in the dispatcher's
/// fallback loop produces one of these; the last one is what reaches the
/// client when every attempt is exhausted (spec §7).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("[{provider}] HTTP {status}: {detail}")]
    Http { provider: String, status: u16, detail: String },
    #[error("[{provider}] request timed out")]
    Timeout { provider: String },
    #[error("[{provider}] connection error: {detail}")]
    Connection { provider: String, detail: String },
    #[error("[{provider}] {detail}")]
    Other { provider: String, detail: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::Http { provider, .. }
            | Self::Timeout { provider }
            | Self::Connection { provider, .. }
            | Self::Other { provider, .. } => provider,
        }
    }
}

/// A single configured upstream provider, with dialect-appropriate HTTP
/// clients built once at construction time.
///
/// Two clients per backend, mirroring the buffered/streaming split the
/// original OpenAI-compatible adapter used: the buffered client carries the
/// full request timeout, the streaming client only a connect timeout since
/// its body arrives incrementally.
pub struct ProviderBackend {
    pub name: String,
    pub dialect: Dialect,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u64,
    client: Client,
    stream_client: Client,
}

impl ProviderBackend {
    pub fn new(name: impl Into<String>, cfg: &ProviderConfig) -> Self {
        let name = name.into();
        let base_url = cfg.base_url.trim_end_matches('/').to_string();

        let headers = match cfg.dialect {
            Dialect::OpenaiCompat => openai::build_headers(&cfg.api_key, &base_url),
            Dialect::GoogleGenai => reqwest::header::HeaderMap::new(),
            Dialect::AnthropicCompat => anthropic::build_headers(&cfg.api_key),
        };

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build streaming reqwest client");

        Self {
            name,
            dialect: cfg.dialect,
            base_url,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            client,
            stream_client,
        }
    }

    /// Send a chat completions request, translating to and from this
    /// backend's wire dialect. The returned JSON is always in OpenAI
    /// chat-completions shape, tagged with a `_clawgate` metadata object.
    pub async fn complete(&self, body: Value) -> Result<Value, ProviderError> {
        match self.dialect {
            Dialect::OpenaiCompat => openai::complete(self, body, false).await,
            Dialect::GoogleGenai => google::complete(self, body).await,
            Dialect::AnthropicCompat => anthropic::complete(self, body).await,
        }
    }

    /// Forward a streaming request. Only the OpenAI-compatible dialect
    /// proxies SSE bytes verbatim; Google and Anthropic dialects require
    /// full response translation and are served non-streaming even when the
    /// caller requests `stream: true` — the dispatcher is responsible for
    /// wrapping a non-stream [`ProviderBackend::complete`] result into a
    /// single SSE frame for those dialects.
    pub async fn complete_stream(&self, body: Value) -> Result<SseStream, ProviderError> {
        match self.dialect {
            Dialect::OpenaiCompat => openai::complete_stream(self, body).await,
            Dialect::GoogleGenai | Dialect::AnthropicCompat => Err(ProviderError::Other {
                provider: self.name.clone(),
                detail: "streaming passthrough is only supported for openai-compat providers".into(),
            }),
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self.dialect, Dialect::OpenaiCompat)
    }

    pub async fn health_check(&self) -> Result<(), ProviderError> {
        match self.dialect {
            Dialect::OpenaiCompat => openai::health_check(self).await,
            Dialect::GoogleGenai => google::health_check(self).await,
            Dialect::AnthropicCompat => anthropic::health_check(self).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pricing, Tier};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(dialect: Dialect, base_url: String) -> ProviderConfig {
        ProviderConfig {
            dialect,
            base_url,
            api_key: "test-key".into(),
            model: "test-model".into(),
            max_tokens: 1000,
            tier: Tier::Default,
            pricing: Pricing { input: 1.0, output: 1.0, cache_read: None },
        }
    }

    #[tokio::test]
    async fn openai_compat_complete_returns_tagged_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_cache_hit_tokens": 5, "prompt_cache_miss_tokens": 10},
            })))
            .mount(&server)
            .await;

        let backend = ProviderBackend::new("p1", &cfg(Dialect::OpenaiCompat, server.uri()));
        let result = backend.complete(json!({"messages": [{"role": "user", "content": "hi"}]})).await.unwrap();

        assert_eq!(result["_clawgate"]["provider"], "p1");
        assert_eq!(result["_clawgate"]["cache_hit_tokens"], 5);
        assert_eq!(result["_clawgate"]["cache_miss_tokens"], 10);
    }

    #[tokio::test]
    async fn openai_compat_errors_on_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let backend = ProviderBackend::new("p1", &cfg(Dialect::OpenaiCompat, server.uri()));
        let err = backend.complete(json!({"messages": []})).await.unwrap_err();
        match err {
            ProviderError::Http { status, .. } => assert_eq!(status, 429),
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn google_genai_complete_translates_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "hello"}]}}],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 3, "totalTokenCount": 13},
            })))
            .mount(&server)
            .await;

        let backend = ProviderBackend::new("gem", &cfg(Dialect::GoogleGenai, server.uri()));
        let result = backend
            .complete(json!({"messages": [{"role": "user", "content": "hi"}]}))
            .await
            .unwrap();

        assert_eq!(result["choices"][0]["message"]["content"], "hello");
        assert_eq!(result["usage"]["prompt_tokens"], 10);
    }

    #[tokio::test]
    async fn streaming_unsupported_for_google_dialect() {
        let backend = ProviderBackend::new("gem", &cfg(Dialect::GoogleGenai, "http://localhost".into()));
        assert!(!backend.supports_streaming());
        assert!(backend.complete_stream(json!({})).await.is_err());
    }
}
