//! Attempt-order construction and the provider dispatch loop.
//!
//! Given a [`RoutingDecision`], tries the chosen provider first, then the
//! rest of `fallback_chain` in order, skipping unhealthy providers except
//! for the first attempt (spec §7, "Attempt order").

use std::time::Instant;

use serde_json::Value;
use tracing::warn;

use crate::{
    app::App,
    backends::{ProviderError, SseStream},
    metrics::{calc_cost, RequestLogEntry},
    routing::RoutingDecision,
};

/// Build the ordered list of providers to attempt: the chosen provider
/// first, then `fallback_chain` in its configured order, excluding the
/// chosen provider and any name not constructed as a backend. No duplicates
/// (P7).
pub fn build_attempt_order(chosen: &str, fallback_chain: &[String], available: &std::collections::HashMap<String, crate::backends::ProviderBackend>) -> Vec<String> {
    let mut order = Vec::new();
    if available.contains_key(chosen) {
        order.push(chosen.to_string());
    }
    for name in fallback_chain {
        if name != chosen && available.contains_key(name) && !order.contains(name) {
            order.push(name.clone());
        }
    }
    order
}

pub enum DispatchResult {
    Complete { body: Value, provider: String },
    Stream { stream: SseStream, provider: String },
}

/// Try every provider in the attempt order until one succeeds. Returns the
/// accumulated per-attempt errors if every attempt fails (spec §7,
/// "Provider error (exhausted)").
pub async fn dispatch(app: &App, decision: &RoutingDecision, request_body: Value, stream: bool) -> Result<DispatchResult, Vec<ProviderError>> {
    let config = app.config().await;
    let order = build_attempt_order(&decision.provider_name, &config.fallback_chain, &app.providers);

    let mut errors = Vec::new();

    for (i, name) in order.iter().enumerate() {
        if i > 0 && !app.health.is_healthy(name).await {
            continue;
        }
        let Some(backend) = app.providers.get(name) else { continue };

        if stream && backend.supports_streaming() {
            let t0 = Instant::now();
            match backend.complete_stream(request_body.clone()).await {
                Ok(s) => {
                    app.health.record_success(name, t0.elapsed().as_secs_f64() * 1000.0).await;
                    return Ok(DispatchResult::Stream { stream: s, provider: name.clone() });
                }
                Err(e) => {
                    app.health.record_failure(name, e.to_string()).await;
                    log_failure(app, decision, name, &e).await;
                    errors.push(e);
                    continue;
                }
            }
        }

        match backend.complete(request_body.clone()).await {
            Ok(body) => {
                app.health.record_success(name, latency_of(&body)).await;
                log_success(app, &config, decision, name, &body).await;
                return Ok(DispatchResult::Complete { body, provider: name.clone() });
            }
            Err(e) => {
                app.health.record_failure(name, e.to_string()).await;
                log_failure(app, decision, name, &e).await;
                errors.push(e);
            }
        }
    }

    Err(errors)
}

fn latency_of(body: &Value) -> f64 {
    body["_clawgate"]["latency_ms"].as_f64().unwrap_or(0.0)
}

async fn log_success(app: &App, config: &crate::config::Config, decision: &RoutingDecision, provider: &str, body: &Value) {
    let Some(metrics) = &app.metrics else { return };
    let Some(pricing_cfg) = config.providers.get(provider) else { return };

    let usage = body.get("usage").cloned().unwrap_or_default();
    let prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion_tokens = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    let cache_hit = body["_clawgate"]["cache_hit_tokens"].as_u64().unwrap_or(0);
    let cache_miss = body["_clawgate"]["cache_miss_tokens"].as_u64().unwrap_or(0);
    let cost = calc_cost(prompt_tokens, completion_tokens, &pricing_cfg.pricing, cache_hit, cache_miss);

    metrics
        .log_request(RequestLogEntry {
            provider: provider.to_string(),
            model: pricing_cfg.model.clone(),
            layer: decision.layer.to_string(),
            rule_name: decision.rule_name.clone(),
            prompt_tokens,
            completion_tokens,
            cache_hit_tokens: cache_hit,
            cache_miss_tokens: cache_miss,
            cost_usd: cost,
            latency_ms: latency_of(body),
            success: true,
            error: None,
        })
        .await;
}

async fn log_failure(app: &App, decision: &RoutingDecision, provider: &str, error: &ProviderError) {
    let Some(metrics) = &app.metrics else { return };
    metrics
        .log_request(RequestLogEntry {
            provider: provider.to_string(),
            model: String::new(),
            layer: decision.layer.to_string(),
            rule_name: decision.rule_name.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_hit_tokens: 0,
            cache_miss_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 0.0,
            success: false,
            error: Some(error.to_string().chars().take(500).collect()),
        })
        .await;
    warn!(provider, error = %error, "provider attempt failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ProviderBackend;
    use crate::config::{Dialect, Pricing, ProviderConfig, Tier};
    use std::collections::HashMap;

    fn backend(name: &str) -> ProviderBackend {
        ProviderBackend::new(
            name,
            &ProviderConfig {
                dialect: Dialect::OpenaiCompat,
                base_url: "http://localhost".into(),
                api_key: "k".into(),
                model: name.into(),
                max_tokens: 100,
                tier: Tier::Default,
                pricing: Pricing { input: 1.0, output: 1.0, cache_read: None },
            },
        )
    }

    #[test]
    fn attempt_order_puts_chosen_first_then_fallback_chain_minus_chosen() {
        let mut available = HashMap::new();
        available.insert("a".to_string(), backend("a"));
        available.insert("b".to_string(), backend("b"));
        available.insert("c".to_string(), backend("c"));

        let order = build_attempt_order("b", &["a".to_string(), "b".to_string(), "c".to_string()], &available);
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn p7_attempt_order_has_no_duplicates() {
        let mut available = HashMap::new();
        available.insert("a".to_string(), backend("a"));

        let order = build_attempt_order("a", &["a".to_string(), "a".to_string()], &available);
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn attempt_order_excludes_providers_without_a_constructed_backend() {
        let mut available = HashMap::new();
        available.insert("a".to_string(), backend("a"));

        let order = build_attempt_order("a", &["a".to_string(), "ghost".to_string()], &available);
        assert_eq!(order, vec!["a"]);
    }
}
