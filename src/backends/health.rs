//! Provider health tracking.
//!
//! A rolling view of each provider's recent call outcomes, consulted by the
//! routing engine's health-validation step and by the dispatcher's
//! attempt-order construction (P4/P7).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

const LATENCY_WINDOW: usize = 20;

/// Live, mutable health state for a single provider. Wrapped in a lock by
/// [`HealthRegistry`] — never cloned while held.
#[derive(Debug)]
pub struct ProviderHealth {
    healthy: bool,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    latencies_ms: VecDeque<f64>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }
}

impl ProviderHealth {
    pub fn record_success(&mut self, latency_ms: f64) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_check = Some(Utc::now());
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    /// Record a failed call. Once `consecutive_failures` reaches
    /// `max_failures` the provider is marked unhealthy (P4).
    pub fn record_failure(&mut self, error: impl Into<String>, max_failures: u32) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.last_check = Some(Utc::now());
        if self.consecutive_failures >= max_failures {
            self.healthy = false;
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    pub fn snapshot(&self) -> ProviderHealthSnapshot {
        ProviderHealthSnapshot {
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
            last_error: self.last_error.clone(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

/// An immutable, point-in-time copy of a provider's health, cheap to pass
/// around and safe to hold across an `await` point without a lock.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProviderHealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub avg_latency_ms: f64,
}

/// Registry of per-provider health state, one entry per configured provider.
pub struct HealthRegistry {
    providers: std::collections::HashMap<String, RwLock<ProviderHealth>>,
    max_failures: u32,
}

impl HealthRegistry {
    pub fn new(provider_names: impl IntoIterator<Item = String>, max_failures: u32) -> Self {
        Self {
            providers: provider_names.into_iter().map(|name| (name, RwLock::new(ProviderHealth::default()))).collect(),
            max_failures,
        }
    }

    pub async fn record_success(&self, provider: &str, latency_ms: f64) {
        if let Some(lock) = self.providers.get(provider) {
            lock.write().await.record_success(latency_ms);
        }
    }

    pub async fn record_failure(&self, provider: &str, error: impl Into<String>) {
        if let Some(lock) = self.providers.get(provider) {
            lock.write().await.record_failure(error, self.max_failures);
        }
    }

    pub async fn is_healthy(&self, provider: &str) -> bool {
        match self.providers.get(provider) {
            Some(lock) => lock.read().await.healthy,
            None => true,
        }
    }

    /// Snapshot every tracked provider's health, keyed by provider name — fed
    /// to the routing engine and the `/health` endpoint.
    pub async fn snapshot_all(&self) -> std::collections::HashMap<String, ProviderHealthSnapshot> {
        let mut out = std::collections::HashMap::with_capacity(self.providers.len());
        for (name, lock) in &self.providers {
            out.insert(name.clone(), lock.read().await.snapshot());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p4_marks_unhealthy_after_max_consecutive_failures() {
        let mut h = ProviderHealth::default();
        h.record_failure("timeout", 3);
        assert!(h.healthy);
        h.record_failure("timeout", 3);
        assert!(h.healthy);
        h.record_failure("timeout", 3);
        assert!(!h.healthy);
    }

    #[test]
    fn success_resets_consecutive_failures_and_heals() {
        let mut h = ProviderHealth::default();
        h.record_failure("timeout", 3);
        h.record_failure("timeout", 3);
        h.record_success(120.0);
        assert!(h.healthy);
        assert_eq!(h.consecutive_failures, 0);
    }

    #[test]
    fn latency_window_caps_at_twenty_entries() {
        let mut h = ProviderHealth::default();
        for i in 0..30 {
            h.record_success(i as f64);
        }
        assert_eq!(h.latencies_ms.len(), LATENCY_WINDOW);
    }

    #[tokio::test]
    async fn registry_tracks_unconfigured_provider_as_healthy_by_default() {
        let registry = HealthRegistry::new(["a".to_string()], 3);
        assert!(registry.is_healthy("unknown").await);
        assert!(registry.is_healthy("a").await);
    }

    #[tokio::test]
    async fn registry_reflects_recorded_failures() {
        let registry = HealthRegistry::new(["a".to_string()], 2);
        registry.record_failure("a", "boom").await;
        registry.record_failure("a", "boom").await;
        assert!(!registry.is_healthy("a").await);
    }
}
