//! Configuration types for clawgate.
//!
//! Config is loaded once at startup from a YAML file. `${VAR}` and
//! `${VAR:-default}` references are expanded against the process environment
//! before parsing, then the document is validated before the server opens any
//! ports. Invalid configs are rejected with a clear error rather than
//! silently falling back to defaults.
//!
//! # Example
//! ```yaml
//! server:
//!   port: 8080
//!
//! providers:
//!   deepseek-chat:
//!     dialect: openai-compat
//!     base_url: https://api.deepseek.com
//!     api_key: ${DEEPSEEK_API_KEY}
//!     model: deepseek-chat
//!     tier: default
//!     pricing: { input: 0.27, output: 1.10 }
//!
//! fallback_chain: [deepseek-chat, gemini-flash]
//!
//! static_rules:
//!   enabled: true
//!   rules:
//!     - name: heartbeat
//!       match: { system_prompt_contains: [heartbeat] }
//!       route_to: gemini-flash-lite
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::routing::rules::{HeuristicRule, StaticRule};

/// Which upstream wire protocol a provider speaks.
///
/// clawgate normalizes all client-facing traffic to OpenAI's chat-completions
/// schema; each dialect describes the translation the [`crate::backends::ProviderBackend`]
/// performs at the edge.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// Standard OpenAI `/chat/completions` protocol (also DeepSeek, OpenRouter,
    /// LM Studio, vLLM, and most self-hosted servers).
    OpenaiCompat,
    /// Google GenAI `generateContent` protocol.
    GoogleGenai,
    /// Anthropic Messages API (`/v1/messages`).
    AnthropicCompat,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenaiCompat => "openai-compat",
            Self::GoogleGenai => "google-genai",
            Self::AnthropicCompat => "anthropic-compat",
        })
    }
}

/// A provider's tier tag — descriptive metadata only; routing decisions are
/// driven entirely by the rule engine, never by this field.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Default,
    Reasoning,
    Cheap,
    Mid,
    Fallback,
    Local,
}

/// USD-per-million-tokens pricing for a provider.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
    /// Rate for cache-hit tokens. Defaults to `input` at cost-computation time
    /// (not at load time) when absent — see [`crate::metrics::calc_cost`].
    #[serde(default)]
    pub cache_read: Option<f64>,
}

impl Pricing {
    /// Effective cache-hit rate: `cache_read` if configured, else `input`.
    pub fn cache_rate(&self) -> f64 {
        self.cache_read.unwrap_or(self.input)
    }
}

/// Per-provider configuration, immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub dialect: Dialect,
    /// Base URL, without a trailing slash or `/chat/completions` suffix.
    pub base_url: String,
    /// Literal key or `${VAR}` reference, already expanded by the time this
    /// struct is deserialized.
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub tier: Tier,
    pub pricing: Pricing,
}

/// `server` config section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: defaults::port() }
    }
}

/// `static_rules` / `heuristic_rules` config sections.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StaticRulesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<StaticRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HeuristicRulesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<HeuristicRule>,
}

/// `llm_classifier` config section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LlmClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Prompt template containing the literal placeholder `{last_user_message}`.
    #[serde(default)]
    pub prompt: String,
    /// Which provider to invoke as the classifier.
    #[serde(default)]
    pub classifier_provider: Option<String>,
    /// Uppercased classifier output → provider name.
    #[serde(default)]
    pub category_routing: HashMap<String, String>,
}

/// `health` config section — thresholds for [`crate::backends::health::ProviderHealth`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "defaults::max_failures")]
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { max_failures: defaults::max_failures() }
    }
}

/// `metrics` config section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "defaults::metrics_enabled")]
    pub enabled: bool,
    /// Configured absolute path override. Subject to the safety invariant in
    /// [`crate::metrics::resolve_db_path`] — `./clawgate.db` and bare
    /// `clawgate.db` are rejected in favour of the platform default.
    #[serde(default)]
    pub db_path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: defaults::metrics_enabled(), db_path: None }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub fallback_chain: Vec<String>,

    #[serde(default)]
    pub static_rules: StaticRulesConfig,

    #[serde(default)]
    pub heuristic_rules: HeuristicRulesConfig,

    #[serde(default)]
    pub llm_classifier: LlmClassifierConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load, expand environment references, parse, and validate a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let expanded = expand_env(&raw);
        let config: Self = serde_yaml::from_str(&expanded).context("parsing config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.providers.is_empty(), "at least one provider must be configured");

        for name in &self.fallback_chain {
            anyhow::ensure!(
                self.providers.contains_key(name),
                "fallback_chain references unknown provider `{}`",
                name
            );
        }

        for rule in &self.static_rules.rules {
            anyhow::ensure!(
                self.providers.contains_key(&rule.route_to),
                "static rule `{}` routes to unknown provider `{}`",
                rule.name,
                rule.route_to
            );
        }
        for rule in &self.heuristic_rules.rules {
            anyhow::ensure!(
                self.providers.contains_key(&rule.route_to),
                "heuristic rule `{}` routes to unknown provider `{}`",
                rule.name,
                rule.route_to
            );
        }
        for provider in self.llm_classifier.category_routing.values() {
            anyhow::ensure!(
                self.providers.contains_key(provider),
                "llm_classifier category_routing references unknown provider `{}`",
                provider
            );
        }
        if self.llm_classifier.enabled {
            anyhow::ensure!(
                self.llm_classifier.prompt.contains("{last_user_message}"),
                "llm_classifier.prompt must contain the `{{last_user_message}}` placeholder"
            );
            anyhow::ensure!(
                self.llm_classifier
                    .classifier_provider
                    .as_ref()
                    .is_some_and(|p| self.providers.contains_key(p)),
                "llm_classifier.classifier_provider must name a configured provider"
            );
        }

        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment. Unset variables with no default expand to the empty string.
///
/// Grounded on the original Python project's `_expand_env`/`_walk_expand`
/// regex-substitution pass over the raw config text, performed before
/// deserialization so any section (including nested maps) may reference
/// environment variables.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = raw[i + 2..].find('}') {
                let inner = &raw[i + 2..i + 2 + end];
                let (var, default) = match inner.split_once(":-") {
                    Some((v, d)) => (v, Some(d)),
                    None => (inner, None),
                };
                let value = std::env::var(var).ok().or_else(|| default.map(str::to_string));
                out.push_str(&value.unwrap_or_default());
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = raw[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

mod defaults {
    pub fn port() -> u16 {
        8080
    }
    pub fn max_tokens() -> u64 {
        8000
    }
    pub fn max_failures() -> u32 {
        3
    }
    pub fn metrics_enabled() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
        providers:
          p1:
            dialect: openai-compat
            base_url: http://localhost:11434
            model: qwen
            pricing: { input: 0.1, output: 0.2 }
        fallback_chain: [p1]
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let expanded = expand_env(minimal_yaml());
        let config: Config = serde_yaml::from_str(&expanded).expect("should parse");
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn validation_rejects_fallback_chain_unknown_provider() {
        let mut config: Config = serde_yaml::from_str(&expand_env(minimal_yaml())).unwrap();
        config.fallback_chain.push("ghost".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_at_least_one_provider() {
        let mut config: Config = serde_yaml::from_str(&expand_env(minimal_yaml())).unwrap();
        config.providers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_env_substitutes_simple_variable() {
        // SAFETY: single-threaded test setup.
        unsafe { std::env::set_var("CLAWGATE_TEST_VAR_1", "hello") };
        let out = expand_env("key: ${CLAWGATE_TEST_VAR_1}");
        assert_eq!(out, "key: hello");
        unsafe { std::env::remove_var("CLAWGATE_TEST_VAR_1") };
    }

    #[test]
    fn expand_env_uses_default_when_unset() {
        let out = expand_env("key: ${CLAWGATE_TEST_VAR_DEFINITELY_UNSET:-fallback}");
        assert_eq!(out, "key: fallback");
    }

    #[test]
    fn expand_env_empty_string_when_unset_and_no_default() {
        let out = expand_env("key: ${CLAWGATE_TEST_VAR_DEFINITELY_UNSET_2}");
        assert_eq!(out, "key: ");
    }

    #[test]
    fn pricing_cache_rate_defaults_to_input() {
        let p = Pricing { input: 0.5, output: 1.0, cache_read: None };
        assert_eq!(p.cache_rate(), 0.5);
    }

    #[test]
    fn pricing_cache_rate_uses_configured_value() {
        let p = Pricing { input: 0.5, output: 1.0, cache_read: Some(0.1) };
        assert_eq!(p.cache_rate(), 0.1);
    }

    #[test]
    fn validation_requires_classifier_prompt_placeholder_when_enabled() {
        let mut config: Config = serde_yaml::from_str(&expand_env(minimal_yaml())).unwrap();
        config.llm_classifier.enabled = true;
        config.llm_classifier.classifier_provider = Some("p1".into());
        config.llm_classifier.prompt = "no placeholder here".into();
        assert!(config.validate().is_err());
    }
}
