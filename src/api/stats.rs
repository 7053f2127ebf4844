//! `GET /api/stats` and `GET /api/recent` — durable metrics readback.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{app::App, error::AppError};

/// `GET /api/stats` — totals, per-provider summary, routing breakdown,
/// 24-hour hourly series, and 30-day daily totals.
pub async fn stats(State(app): State<Arc<App>>) -> Result<impl IntoResponse, AppError> {
    let Some(metrics) = &app.metrics else {
        return Ok(Json(json!({ "enabled": false })));
    };

    let totals = metrics.get_totals().await?;
    let by_provider = metrics.get_provider_summary().await?;
    let routing_breakdown = metrics.get_routing_breakdown().await?;
    let hourly = metrics.get_hourly_series(24).await?;
    let daily = metrics.get_daily_totals(30).await?;

    Ok(Json(json!({
        "enabled": true,
        "totals": totals,
        "by_provider": by_provider,
        "routing_breakdown": routing_breakdown,
        "hourly": hourly,
        "daily": daily,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// `GET /api/recent?limit=N` — last N log entries.
pub async fn recent(State(app): State<Arc<App>>, Query(query): Query<RecentQuery>) -> Result<impl IntoResponse, AppError> {
    let Some(metrics) = &app.metrics else {
        return Ok(Json(json!({ "enabled": false, "entries": [] })));
    };
    let entries = metrics.get_recent(query.limit).await?;
    Ok(Json(json!({ "enabled": true, "entries": entries })))
}
