//! Static and heuristic rule types.
//!
//! Each rule's `match` object is modeled as a tagged enum rather than a bag of
//! optional fields (Design Notes §9, "Tagged rule variants"): an unknown
//! matcher key is a `serde_yaml` deserialization error at config-load time,
//! not a silently-ignored field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::context::RoutingContext;

/// A named static rule: `match` predicate + destination provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticRule {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: StaticMatch,
    pub route_to: String,
}

/// Layer-1 matcher kinds. Untagged so that YAML authors write the natural
/// `any:`/`model_requested:`/`system_prompt_contains:`/`header_contains:` keys
/// directly, while still rejecting any key that isn't one of the four.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StaticMatch {
    #[serde(default)]
    pub any: Vec<StaticMatch>,
    #[serde(default)]
    pub model_requested: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt_contains: Option<Vec<String>>,
    #[serde(default)]
    pub header_contains: Option<HashMap<String, Vec<String>>>,
}

impl StaticMatch {
    /// Evaluate this matcher against a routing context.
    ///
    /// `model_requested` and `system_prompt_contains`, when the ONLY key
    /// present, terminate as false on a miss rather than falling through to
    /// an implicit true (spec §4.1).
    pub fn evaluate(&self, ctx: &RoutingContext) -> bool {
        if !self.any.is_empty() {
            return self.any.iter().any(|m| m.evaluate(ctx));
        }
        if let Some(patterns) = &self.model_requested {
            return patterns.iter().any(|p| ctx.model_requested.contains(p.to_lowercase().as_str()));
        }
        if let Some(keywords) = &self.system_prompt_contains {
            let system_lower = ctx.system_prompt.to_lowercase();
            return keywords.iter().any(|k| system_lower.contains(k.to_lowercase().as_str()));
        }
        if let Some(headers) = &self.header_contains {
            return headers.iter().any(|(name, patterns)| {
                ctx.headers
                    .get(name.to_lowercase().as_str())
                    .is_some_and(|value| patterns.iter().any(|p| value.contains(p.to_lowercase().as_str())))
            });
        }
        false
    }
}

/// A named heuristic rule: `match` predicate + destination provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeuristicRule {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: HeuristicMatch,
    pub route_to: String,
}

/// Layer-2 matcher kinds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeuristicMatch {
    #[serde(default)]
    pub fallthrough: Option<bool>,
    #[serde(default)]
    pub has_tools: Option<bool>,
    #[serde(default)]
    pub estimated_tokens: Option<TokenBound>,
    #[serde(default)]
    pub message_keywords: Option<MessageKeywords>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenBound {
    #[serde(default)]
    pub less_than: Option<u64>,
    #[serde(default)]
    pub greater_than: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageKeywords {
    pub any_of: Vec<String>,
    #[serde(default = "default_min_matches")]
    pub min_matches: usize,
}

fn default_min_matches() -> usize {
    1
}

impl HeuristicMatch {
    pub fn evaluate(&self, ctx: &RoutingContext) -> bool {
        if self.fallthrough == Some(true) {
            return true;
        }
        if let Some(want) = self.has_tools {
            return want == ctx.has_tools;
        }
        if let Some(bound) = &self.estimated_tokens {
            let mut matched = false;
            if let Some(lt) = bound.less_than {
                matched = matched || ctx.estimated_tokens < lt;
            }
            if let Some(gt) = bound.greater_than {
                matched = matched || ctx.estimated_tokens > gt;
            }
            return matched;
        }
        if let Some(kw) = &self.message_keywords {
            // Restricted to the last user message only — system prompts must
            // never contribute to keyword scoring (P1).
            let last_user_lower = ctx.last_user_message.to_lowercase();
            let count = kw
                .any_of
                .iter()
                .filter(|k| last_user_lower.contains(k.to_lowercase().as_str()))
                .count();
            return count >= kw.min_matches;
        }
        false
    }
}
