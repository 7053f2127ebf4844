//! Durable, append-only request log and cost metrics, backed by SQLite.
//!
//! Grounded on the original project's `MetricsStore`: WAL journaling with
//! relaxed synchronous durability (at-most-seconds of data may be lost on
//! crash, never a torn write), a single shared connection, and storage
//! errors that are logged but never propagated to the request path.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::warn;

use crate::config::Pricing;

const CREATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    layer TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    cache_hit_tokens INTEGER NOT NULL,
    cache_miss_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    latency_ms REAL NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_requests_provider ON requests(provider);
CREATE INDEX IF NOT EXISTS idx_requests_layer ON requests(layer);
"#;

/// Compute the USD cost of a single completion.
///
/// When either `cache_hit` or `cache_miss` is non-zero, cache-aware pricing
/// applies: cache-hit tokens at `pricing.cache_rate()`, cache-miss tokens at
/// `pricing.input`. Otherwise the plain `prompt`/`completion` split is
/// priced at `pricing.input`/`pricing.output`. All rates are USD per million
/// tokens.
pub fn calc_cost(prompt: u64, completion: u64, pricing: &Pricing, cache_hit: u64, cache_miss: u64) -> f64 {
    if cache_hit != 0 || cache_miss != 0 {
        (cache_hit as f64 * pricing.cache_rate() + cache_miss as f64 * pricing.input) / 1e6
            + (completion as f64 * pricing.output) / 1e6
    } else {
        (prompt as f64 * pricing.input + completion as f64 * pricing.output) / 1e6
    }
}

/// A single request outcome to be logged. Constructed by the dispatcher
/// after each attempt (successful or not).
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub provider: String,
    pub model: String,
    pub layer: String,
    pub rule_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_hit_tokens: u64,
    pub cache_miss_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Totals {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub total_cost_usd: f64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub provider: String,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_hit_pct: f64,
    pub cost_usd: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingBreakdownEntry {
    pub layer: String,
    pub rule_name: String,
    pub provider: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    pub hour: String,
    pub count: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyBucket {
    pub date: String,
    pub count: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentEntry {
    pub id: i64,
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub layer: String,
    pub rule_name: String,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

/// Durable request-log store. A single SQLite connection, shared by every
/// writer and reader behind a `std::sync::Mutex` so it can be locked from
/// inside `spawn_blocking` (rusqlite's `Connection` is not `Sync`).
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetricsStore {
    /// Open (creating if absent) the SQLite database at `path`, set WAL +
    /// relaxed synchronous durability, and create the schema.
    pub fn init(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(CREATE_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Log a single request outcome. Never fails visibly — storage errors
    /// are logged at `warn` and otherwise ignored (spec §7, "Metrics error").
    pub async fn log_request(&self, entry: RequestLogEntry) {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = conn.lock().expect("metrics connection mutex poisoned");
            conn.execute(
                "INSERT INTO requests (
                    timestamp, provider, model, layer, rule_name,
                    prompt_tokens, completion_tokens, cache_hit_tokens, cache_miss_tokens,
                    cost_usd, latency_ms, success, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    Utc::now().to_rfc3339(),
                    entry.provider,
                    entry.model,
                    entry.layer,
                    entry.rule_name,
                    entry.prompt_tokens,
                    entry.completion_tokens,
                    entry.cache_hit_tokens,
                    entry.cache_miss_tokens,
                    entry.cost_usd,
                    entry.latency_ms,
                    entry.success as i64,
                    entry.error,
                ],
            )?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to write metrics log entry"),
            Err(e) => warn!(error = %e, "metrics log task panicked"),
        }
    }

    pub async fn get_totals(&self) -> anyhow::Result<Totals> {
        self.blocking_query(|conn| {
            conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(success), 0),
                    COALESCE(SUM(1 - success), 0),
                    COALESCE(SUM(cost_usd), 0.0),
                    COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0),
                    MIN(timestamp),
                    MAX(timestamp)
                FROM requests",
                [],
                |row| {
                    Ok(Totals {
                        total_requests: row.get(0)?,
                        successful_requests: row.get(1)?,
                        failed_requests: row.get(2)?,
                        total_cost_usd: row.get(3)?,
                        total_prompt_tokens: row.get(4)?,
                        total_completion_tokens: row.get(5)?,
                        first_timestamp: row.get(6)?,
                        last_timestamp: row.get(7)?,
                    })
                },
            )
        })
        .await
    }

    pub async fn get_provider_summary(&self) -> anyhow::Result<Vec<ProviderSummary>> {
        self.blocking_query(|conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    provider,
                    COUNT(*),
                    COALESCE(SUM(1 - success), 0),
                    COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0),
                    COALESCE(SUM(cache_hit_tokens), 0),
                    COALESCE(SUM(cache_miss_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0),
                    COALESCE(AVG(latency_ms), 0.0)
                FROM requests
                GROUP BY provider
                ORDER BY provider",
            )?;
            let rows = stmt.query_map([], |row| {
                let cache_hit: i64 = row.get(5)?;
                let cache_miss: i64 = row.get(6)?;
                let denom = cache_hit + cache_miss;
                let cache_hit_pct = if denom == 0 { 0.0 } else { (cache_hit as f64 / denom as f64 * 100.0 * 10.0).round() / 10.0 };
                Ok(ProviderSummary {
                    provider: row.get(0)?,
                    total_requests: row.get(1)?,
                    failed_requests: row.get(2)?,
                    prompt_tokens: row.get(3)?,
                    completion_tokens: row.get(4)?,
                    cache_hit_pct,
                    cost_usd: row.get(7)?,
                    avg_latency_ms: row.get(8)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_routing_breakdown(&self) -> anyhow::Result<Vec<RoutingBreakdownEntry>> {
        self.blocking_query(|conn| {
            let mut stmt = conn.prepare(
                "SELECT layer, rule_name, provider, COUNT(*)
                FROM requests
                WHERE success = 1
                GROUP BY layer, rule_name, provider
                ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RoutingBreakdownEntry { layer: row.get(0)?, rule_name: row.get(1)?, provider: row.get(2)?, count: row.get(3)? })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_hourly_series(&self, hours: u32) -> anyhow::Result<Vec<HourlyBucket>> {
        self.blocking_query(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m-%dT%H:00:00', timestamp) AS hour, COUNT(*), COALESCE(SUM(cost_usd), 0.0)
                FROM requests
                WHERE timestamp >= datetime('now', printf('-%d hours', ?1))
                GROUP BY hour
                ORDER BY hour",
            )?;
            let rows = stmt.query_map(params![hours], |row| {
                Ok(HourlyBucket { hour: row.get(0)?, count: row.get(1)?, cost_usd: row.get(2)? })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_daily_totals(&self, days: u32) -> anyhow::Result<Vec<DailyBucket>> {
        self.blocking_query(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT date(timestamp, 'localtime') AS day, COUNT(*), COALESCE(SUM(cost_usd), 0.0)
                FROM requests
                WHERE timestamp >= datetime('now', printf('-%d days', ?1))
                GROUP BY day
                ORDER BY day",
            )?;
            let rows = stmt.query_map(params![days], |row| {
                Ok(DailyBucket { date: row.get(0)?, count: row.get(1)?, cost_usd: row.get(2)? })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_recent(&self, limit: u32) -> anyhow::Result<Vec<RecentEntry>> {
        self.blocking_query(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, provider, model, layer, rule_name, cost_usd, latency_ms, success, error
                FROM requests
                ORDER BY id DESC
                LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let success: i64 = row.get(8)?;
                Ok(RecentEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    provider: row.get(2)?,
                    model: row.get(3)?,
                    layer: row.get(4)?,
                    rule_name: row.get(5)?,
                    cost_usd: row.get(6)?,
                    latency_ms: row.get(7)?,
                    success: success != 0,
                    error: row.get(9)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn close(&self) {
        // Connection is dropped with the Arc; nothing to flush explicitly
        // under WAL mode beyond what SQLite already does on close.
    }

    async fn blocking_query<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("metrics connection mutex poisoned");
            f(&conn)
        })
        .await?;
        Ok(result?)
    }
}

/// Resolve the effective metrics database path (P6 — safety invariant).
///
/// Priority: an explicit `CLAWGATE_DB_PATH` environment override; a
/// configured absolute path; an XDG data-home location; a home-directory
/// default. A configured path equal to `./clawgate.db` or the bare name
/// `clawgate.db` is rejected (it would place the database in whatever
/// directory the process happens to be launched from) in favour of the
/// platform default — unless it reached us via the environment override,
/// which is trusted as an explicit choice.
pub fn resolve_db_path(configured: Option<&str>) -> PathBuf {
    if let Ok(env_override) = std::env::var("CLAWGATE_DB_PATH") {
        if !env_override.is_empty() {
            return PathBuf::from(env_override);
        }
    }

    if let Some(path) = configured {
        if !is_unsafe_relative_path(path) {
            return PathBuf::from(path);
        }
        warn!(path, "metrics.db_path is an unsafe relative path — using the platform default instead");
    }

    if let Some(data_dir) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(data_dir).join("clawgate").join("clawgate.db");
    }

    home_dir().join(".clawgate").join("clawgate.db")
}

fn is_unsafe_relative_path(path: &str) -> bool {
    path == "clawgate.db" || path == "./clawgate.db"
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pricing;

    fn pricing(input: f64, output: f64, cache_read: Option<f64>) -> Pricing {
        Pricing { input, output, cache_read }
    }

    #[test]
    fn cost_anchor_plain_tokens() {
        let p = pricing(0.27, 1.10, None);
        let cost = calc_cost(1_000_000, 1_000_000, &p, 0, 0);
        assert!((cost - 1.37).abs() < 1e-9);
    }

    #[test]
    fn cost_anchor_cache_hit() {
        let p = pricing(0.27, 1.10, Some(0.07));
        let cost = calc_cost(1000, 0, &p, 1000, 0);
        assert!((cost - 0.00007).abs() < 1e-9);
    }

    #[test]
    fn cost_anchor_zero_tokens() {
        let p = pricing(0.27, 1.10, None);
        assert_eq!(calc_cost(0, 0, &p, 0, 0), 0.0);
    }

    #[test]
    fn p5_cost_strictly_decreases_as_cache_hit_share_increases() {
        let p = pricing(1.0, 0.0, Some(0.1));
        let total = 1000;
        let mut prev = calc_cost(0, 0, &p, 0, total);
        for k in 1..=total {
            let cost = calc_cost(0, 0, &p, k, total - k);
            assert!(cost < prev, "cost should strictly decrease as cache hits increase");
            prev = cost;
        }
    }

    #[test]
    fn p6_rejects_bare_and_dot_slash_relative_paths() {
        let resolved = resolve_db_path(Some("clawgate.db"));
        assert_ne!(resolved, PathBuf::from("clawgate.db"));
        let resolved2 = resolve_db_path(Some("./clawgate.db"));
        assert_ne!(resolved2, PathBuf::from("./clawgate.db"));
    }

    #[test]
    fn p6_accepts_absolute_configured_path() {
        let resolved = resolve_db_path(Some("/var/lib/clawgate/clawgate.db"));
        assert_eq!(resolved, PathBuf::from("/var/lib/clawgate/clawgate.db"));
    }

    #[tokio::test]
    async fn log_request_and_get_totals_roundtrip() {
        let dir = std::env::temp_dir().join(format!("clawgate-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("metrics.db");
        let store = MetricsStore::init(&db_path).unwrap();

        store
            .log_request(RequestLogEntry {
                provider: "p1".into(),
                model: "m1".into(),
                layer: "static".into(),
                rule_name: "r1".into(),
                prompt_tokens: 10,
                completion_tokens: 5,
                cache_hit_tokens: 0,
                cache_miss_tokens: 0,
                cost_usd: 0.01,
                latency_ms: 120.0,
                success: true,
                error: None,
            })
            .await;

        let totals = store.get_totals().await.unwrap();
        assert_eq!(totals.total_requests, 1);
        assert_eq!(totals.successful_requests, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
