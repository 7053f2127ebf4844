//! The process-wide application handle.
//!
//! Replaces ad-hoc globals (Design Notes §9, "Global mutable state") with a
//! single struct constructed once in `main` and threaded through every HTTP
//! handler via [`axum::extract::State`]. Tests can construct as many
//! independent `App`s in-process as they need.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    backends::{health::HealthRegistry, ProviderBackend},
    config::Config,
    metrics::{resolve_db_path, MetricsStore},
    routing::{ClassifierFn, RoutingEngine},
};

pub struct App {
    config: RwLock<Arc<Config>>,
    pub providers: Arc<HashMap<String, ProviderBackend>>,
    pub health: HealthRegistry,
    pub routing: RoutingEngine,
    pub metrics: Option<MetricsStore>,
    pub config_path: PathBuf,
}

impl App {
    /// Construct every long-lived piece of gateway state from a loaded
    /// config: one [`ProviderBackend`] per provider whose API key resolves
    /// to non-empty, a health registry, the routing engine (with the
    /// classifier callback wired to whichever provider `llm_classifier`
    /// names), and the metrics store.
    pub fn new(config: Config, config_path: PathBuf) -> anyhow::Result<Self> {
        let mut providers = HashMap::new();
        for (name, provider_cfg) in &config.providers {
            if provider_cfg.api_key.is_empty() {
                warn!(provider = %name, "skipping provider with no resolved API key");
                continue;
            }
            providers.insert(name.clone(), ProviderBackend::new(name.clone(), provider_cfg));
        }
        let providers = Arc::new(providers);

        let health = HealthRegistry::new(providers.keys().cloned(), config.health.max_failures);

        let classifier = build_classifier(&config, Arc::clone(&providers));
        let routing = RoutingEngine::new(classifier);

        let metrics = if config.metrics.enabled {
            let path = resolve_db_path(config.metrics.db_path.as_deref());
            Some(MetricsStore::init(&path)?)
        } else {
            None
        };

        Ok(Self { config: RwLock::new(Arc::new(config)), providers, health, routing, metrics, config_path })
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().await)
    }

    /// Swap in a freshly-loaded config. Provider backends and the health
    /// registry are NOT rebuilt — only the routing rules, fallback chain,
    /// and classifier configuration are live-reloaded. Rebuilding backend
    /// HTTP clients on every edit would tear down in-flight connections for
    /// an edit that, in practice, is almost always just a rule tweak.
    pub async fn replace_config(&self, new_config: Arc<Config>) {
        *self.config.write().await = new_config;
    }
}

/// Wire the LLM-classifier layer's callback to whichever provider
/// `llm_classifier.classifier_provider` names, without the routing engine
/// ever importing [`crate::backends`] directly (Design Notes §9).
fn build_classifier(config: &Config, providers: Arc<HashMap<String, ProviderBackend>>) -> Option<ClassifierFn> {
    if !config.llm_classifier.enabled {
        return None;
    }
    let provider_name = config.llm_classifier.classifier_provider.clone()?;

    Some(Arc::new(move |prompt: String| {
        let providers = Arc::clone(&providers);
        let provider_name = provider_name.clone();
        Box::pin(async move {
            let backend = providers
                .get(&provider_name)
                .ok_or_else(|| anyhow::anyhow!("classifier provider `{provider_name}` has no constructed backend"))?;
            let body = serde_json::json!({
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": 20,
            });
            let response = backend.complete(body).await?;
            Ok(response["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string())
        })
    }))
}
