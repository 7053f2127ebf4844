//! The routing engine — a three-layer classifier that produces a
//! [`RoutingDecision`] for a chat-completion request.
//!
//! Layers run in fixed order (static → heuristic → LLM-classify) and the
//! first layer to produce a decision wins; health validation runs once,
//! immediately after that layer matches, not between layers.

pub mod context;
pub mod rules;

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use tracing::debug;

use crate::{backends::health::ProviderHealthSnapshot, config::Config};
use context::RoutingContext;

/// Boxed async classifier callback: `(prompt) -> provider's raw text reply`.
///
/// Injected by the dispatcher at `App` construction time so the routing
/// engine never depends on [`crate::backends`] directly (Design Notes §9,
/// "Classifier callback injection").
pub type ClassifierFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

/// Which layer produced a [`RoutingDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Static,
    Heuristic,
    LlmClassify,
    Direct,
    Fallback,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Static => "static",
            Self::Heuristic => "heuristic",
            Self::LlmClassify => "llm-classify",
            Self::Direct => "direct",
            Self::Fallback => "fallback",
        })
    }
}

/// The outcome of a single `route()` call. Not persisted except via metrics.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub provider_name: String,
    pub layer: Layer,
    pub rule_name: String,
    pub confidence: f64,
    pub reason: String,
    pub elapsed_ms: f64,
}

/// The routing engine. Holds a reference to the live config and the injected
/// classifier callback; stateless otherwise — `route()` never mutates engine
/// state, guaranteeing determinism (P2).
pub struct RoutingEngine {
    classifier: Option<ClassifierFn>,
}

impl RoutingEngine {
    pub fn new(classifier: Option<ClassifierFn>) -> Self {
        Self { classifier }
    }

    /// Produce a routing decision. Never fails: absent any match, falls
    /// through to the `fallback` layer naming the first fallback-chain
    /// provider.
    pub async fn route(
        &self,
        config: &Config,
        messages: &[Value],
        model_requested: Option<&str>,
        has_tools: bool,
        headers: HashMap<String, String>,
        provider_health: &HashMap<String, ProviderHealthSnapshot>,
    ) -> RoutingDecision {
        let t0 = std::time::Instant::now();
        let ctx = RoutingContext::extract(messages, model_requested, has_tools, headers);

        let raw = self.layer_static(config, &ctx).await;
        let raw = match raw {
            Some(d) => Some(d),
            None => self.layer_heuristic(config, &ctx).await,
        };
        let raw = match raw {
            Some(d) => Some(d),
            None => self.layer_llm_classify(config, &ctx).await,
        };
        let mut decision = raw.unwrap_or_else(|| self.fallback_decision(config));
        decision.elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;

        self.validate_health(config, decision, provider_health)
    }

    async fn layer_static(&self, config: &Config, ctx: &RoutingContext) -> Option<RoutingDecision> {
        if !config.static_rules.enabled {
            return None;
        }
        for rule in &config.static_rules.rules {
            if rule.matcher.evaluate(ctx) {
                debug!(rule = %rule.name, provider = %rule.route_to, "static rule matched");
                return Some(RoutingDecision {
                    provider_name: rule.route_to.clone(),
                    layer: Layer::Static,
                    rule_name: rule.name.clone(),
                    confidence: 1.0,
                    reason: format!("static rule `{}` matched", rule.name),
                    elapsed_ms: 0.0,
                });
            }
        }
        None
    }

    async fn layer_heuristic(&self, config: &Config, ctx: &RoutingContext) -> Option<RoutingDecision> {
        if !config.heuristic_rules.enabled {
            return None;
        }
        for rule in &config.heuristic_rules.rules {
            if rule.matcher.evaluate(ctx) {
                debug!(rule = %rule.name, provider = %rule.route_to, "heuristic rule matched");
                return Some(RoutingDecision {
                    provider_name: rule.route_to.clone(),
                    layer: Layer::Heuristic,
                    rule_name: rule.name.clone(),
                    confidence: 0.8,
                    reason: format!("heuristic rule `{}` matched", rule.name),
                    elapsed_ms: 0.0,
                });
            }
        }
        None
    }

    async fn layer_llm_classify(&self, config: &Config, ctx: &RoutingContext) -> Option<RoutingDecision> {
        if !config.llm_classifier.enabled {
            return None;
        }
        let classify = self.classifier.as_ref()?;

        let truncated: String = ctx.last_user_message.chars().take(500).collect();
        let prompt = config.llm_classifier.prompt.replace("{last_user_message}", &truncated);

        let result = match classify(prompt).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "llm classifier call failed — falling through");
                return None;
            }
        };

        let category = result.trim().to_uppercase();
        let provider = config.llm_classifier.category_routing.get(&category)?;

        Some(RoutingDecision {
            provider_name: provider.clone(),
            layer: Layer::LlmClassify,
            rule_name: category.to_lowercase(),
            confidence: 0.7,
            reason: format!("llm classifier selected category `{category}`"),
            elapsed_ms: 0.0,
        })
    }

    fn fallback_decision(&self, config: &Config) -> RoutingDecision {
        let provider_name = config
            .fallback_chain
            .first()
            .cloned()
            .unwrap_or_else(|| "no-provider-configured".to_string());
        RoutingDecision {
            provider_name,
            layer: Layer::Fallback,
            rule_name: "no-match".to_string(),
            confidence: 0.3,
            reason: "no layer produced a match".to_string(),
            elapsed_ms: 0.0,
        }
    }

    /// After a decision is produced, walk the fallback chain for the first
    /// healthy provider if the chosen one is currently unhealthy. Preserves
    /// the original layer, multiplies confidence by 0.8, and suffixes
    /// `rule_name` with `→fallback`.
    fn validate_health(
        &self,
        config: &Config,
        decision: RoutingDecision,
        provider_health: &HashMap<String, ProviderHealthSnapshot>,
    ) -> RoutingDecision {
        let healthy = provider_health
            .get(&decision.provider_name)
            .map(|h| h.healthy)
            .unwrap_or(true);
        if healthy {
            return decision;
        }

        let fallback = config
            .fallback_chain
            .iter()
            .find(|name| {
                **name != decision.provider_name
                    && provider_health.get(*name).map(|h| h.healthy).unwrap_or(true)
            })
            .cloned();

        match fallback {
            Some(provider_name) => RoutingDecision {
                provider_name,
                layer: decision.layer,
                rule_name: format!("{}→fallback", decision.rule_name),
                confidence: decision.confidence * 0.8,
                reason: format!("{} (original provider unhealthy)", decision.reason),
                elapsed_ms: decision.elapsed_ms,
            },
            None => decision,
        }
    }

    /// Direct-routing bypass: when `model_requested` exactly names a
    /// configured provider, skip the engine entirely.
    pub fn direct_decision(provider_name: &str) -> RoutingDecision {
        RoutingDecision {
            provider_name: provider_name.to_string(),
            layer: Layer::Direct,
            rule_name: "explicit-model".to_string(),
            confidence: 1.0,
            reason: format!("model `{provider_name}` names a configured provider directly"),
            elapsed_ms: 0.0,
        }
    }
}
