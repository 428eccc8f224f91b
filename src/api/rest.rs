// =============================================================================
// REST API endpoints -- Axum 0.7
// =============================================================================
//
// Public endpoints: POST /tv-webhook (secret in body), GET /status, /latest,
// /price, /events, WS /ws/prices. Admin endpoints (POST /config, DELETE
// /events/{symbol}) require the X-Admin-Token header.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::auth::AdminToken;
use crate::app_state::AppState;
use crate::evaluation::LatestEvaluation;
use crate::runtime_config::RuntimeConfig;
use crate::store::{events_key, latest_key, KeyedStore};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // -- Webhook ingress --------------------------------------------
        .route("/tv-webhook", post(crate::api::webhook::tv_webhook))
        // -- Public reads -----------------------------------------------
        .route("/status", get(status))
        .route("/latest", get(latest))
        .route("/price", get(price))
        .route("/events", get(events))
        // -- Admin ------------------------------------------------------
        .route("/config", post(update_config))
        .route("/events/:symbol", delete(delete_event))
        // -- WebSocket --------------------------------------------------
        .route("/ws/prices", get(crate::api::ws::prices_ws))
        // -- Middleware & state -----------------------------------------
        .layer(cors)
        .with_state(state)
}

fn internal_error(e: anyhow::Error, path: &str) -> Response {
    error!(error = %e, path, "unhandled exception");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "Internal server error"})),
    )
        .into_response()
}

fn not_found(detail: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"detail": detail}))).into_response()
}

// =============================================================================
// Timestamp rendering
// =============================================================================

fn ts_human_utc(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| format!("{} UTC", dt.format("%Y-%m-%d %H:%M:%S")))
        .unwrap_or_default()
}

/// Event timestamps are also rendered in Turkey time (UTC+3).
fn ts_human_tr(ts: i64) -> String {
    let tz = FixedOffset::east_opt(3 * 3600).expect("fixed offset in range");
    DateTime::from_timestamp(ts, 0)
        .map(|dt| format!("{} TR", dt.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S")))
        .unwrap_or_default()
}

/// Parse a `YYYY-MM-DD[ HH:MM[:SS]]` filter value to epoch seconds (UTC).
fn parse_datetime(val: &str) -> Option<i64> {
    let val = val.trim();
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(val, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(val, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

// =============================================================================
// GET /status
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    redis_ok: bool,
    events_last_minute: i64,
    uptime_seconds: u64,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let redis_ok = state.store.ping().await.is_ok();

    // Sum the rate buckets covering roughly the last minute. Counting errors
    // degrade to zero rather than failing the health check.
    let events_last_minute = count_recent_events(
        state.store.as_ref(),
        state.settings.rate_limit_window_sec,
    )
    .await
    .unwrap_or(0);

    Json(StatusResponse {
        status: if redis_ok { "ok" } else { "degraded" },
        redis_ok,
        events_last_minute,
        uptime_seconds: state.uptime_seconds(),
    })
}

async fn count_recent_events(store: &dyn KeyedStore, window_sec: u64) -> anyhow::Result<i64> {
    let window_sec = window_sec.max(1);
    let bucket = chrono::Utc::now().timestamp() / window_sec as i64;
    let buckets = (60 / window_sec).max(1) as i64;

    let mut total = 0;
    for offset in 0..buckets {
        let keys = store
            .scan_keys(&format!("tv:rate:*:{}", bucket - offset))
            .await?;
        for key in keys {
            if let Some(val) = store.get(&key).await? {
                total += val.parse::<i64>().unwrap_or(0);
            }
        }
    }
    Ok(total)
}

// =============================================================================
// GET /latest
// =============================================================================

#[derive(Deserialize)]
struct SymbolQuery {
    symbol: String,
}

async fn latest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> Response {
    let symbol = query.symbol.trim().to_uppercase();

    let raw = match state.store.get(&latest_key(&symbol)).await {
        Ok(raw) => raw,
        Err(e) => return internal_error(e, "/latest"),
    };
    let Some(raw) = raw else {
        return not_found(format!("No evaluation found for {symbol}"));
    };

    let envelope: LatestEvaluation = match serde_json::from_str(&raw) {
        Ok(envelope) => envelope,
        Err(e) => return internal_error(e.into(), "/latest"),
    };

    let mut data = match serde_json::to_value(&envelope) {
        Ok(data) => data,
        Err(e) => return internal_error(e.into(), "/latest"),
    };

    // Humanized timestamps alongside the raw epochs.
    data["evaluated_at_human"] = json!(ts_human_utc(envelope.evaluated_at));
    if let Some(ai) = &envelope.latest_ai {
        data["latest_ai"]["generated_at_human"] = json!(ts_human_utc(ai.generated_at));
    }
    if let Some(signals) = data["latest_rules"]["signals_used"].as_array_mut() {
        for sig in signals {
            if let Some(ts) = sig.get("ts").and_then(Value::as_i64) {
                sig["ts_human"] = json!(ts_human_utc(ts));
            }
        }
    }

    Json(data).into_response()
}

// =============================================================================
// GET /price
// =============================================================================

async fn price(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> Response {
    let symbol = query.symbol.trim().to_uppercase();

    let Some(price) = state.prices.get(&symbol) else {
        return not_found(format!("No live price for {symbol}"));
    };

    let market = state.market.get_market_summaries(&symbol).await;
    Json(json!({
        "symbol": symbol,
        "price": price,
        "market": market,
    }))
    .into_response()
}

// =============================================================================
// GET /events
// =============================================================================

#[derive(Deserialize)]
struct EventsQuery {
    symbol: String,
    limit: Option<usize>,
    indicator: Option<String>,
    tf: Option<String>,
    signal: Option<String>,
    after: Option<String>,
    before: Option<String>,
}

/// Parsed, case-folded browse filters.
struct EventsFilter {
    indicator: Option<String>,
    tf: Option<String>,
    signal: Option<String>,
    after_ts: Option<i64>,
    before_ts: Option<i64>,
    limit: usize,
}

async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let symbol = query.symbol.trim().to_uppercase();

    let limit = query.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"detail": "limit must be between 1 and 500"})),
        )
            .into_response();
    }

    let mut after_ts = None;
    let mut before_ts = None;
    for (label, raw_val, target) in [
        ("after", &query.after, &mut after_ts),
        ("before", &query.before, &mut before_ts),
    ] {
        if let Some(raw_val) = raw_val {
            match parse_datetime(raw_val) {
                Some(ts) => *target = Some(ts),
                None => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "detail": format!(
                                "Invalid {label} format: '{raw_val}'. Use YYYY-MM-DD or YYYY-MM-DD HH:MM"
                            )
                        })),
                    )
                        .into_response();
                }
            }
        }
    }

    // Over-fetch from the tail so post-filter results can still fill `limit`.
    let raw_list = match state
        .store
        .lrange(&events_key(&symbol), -((limit * 3) as isize), -1)
        .await
    {
        Ok(raw_list) => raw_list,
        Err(e) => return internal_error(e, "/events"),
    };

    let filter = EventsFilter {
        indicator: query.indicator,
        tf: query.tf,
        signal: query.signal,
        after_ts,
        before_ts,
        limit,
    };
    let events = filter_events(&raw_list, &filter);

    Json(json!({
        "symbol": symbol,
        "count": events.len(),
        "events": events,
    }))
    .into_response()
}

/// Walk the stored entries newest-first, dropping corrupt rows, applying the
/// filters, stripping secrets and enriching timestamps.
fn filter_events(raw_list: &[String], filter: &EventsFilter) -> Vec<Value> {
    let mut events = Vec::new();

    for raw in raw_list.iter().rev() {
        let Ok(mut ev) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        let Some(obj) = ev.as_object_mut() else {
            continue;
        };

        // Secrets never leave the store, including inside the preserved raw
        // payload.
        obj.remove("secret");
        if let Some(raw_map) = obj.get_mut("raw").and_then(Value::as_object_mut) {
            raw_map.remove("secret");
        }

        let ev_ts = obj.get("ts").and_then(Value::as_i64).unwrap_or(0);
        if filter.after_ts.is_some_and(|after| ev_ts < after) {
            continue;
        }
        if filter.before_ts.is_some_and(|before| ev_ts > before) {
            continue;
        }

        let field_matches = |field: &str, wanted: &Option<String>| match wanted {
            Some(wanted) => obj
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|have| have.eq_ignore_ascii_case(wanted)),
            None => true,
        };
        if !field_matches("indicator", &filter.indicator)
            || !field_matches("tf", &filter.tf)
            || !field_matches("signal", &filter.signal)
        {
            continue;
        }

        if ev_ts > 0 {
            obj.insert("ts_human".to_string(), json!(ts_human_tr(ev_ts)));
        }
        if let Some(recv) = obj.get("received_at").and_then(Value::as_i64) {
            obj.insert("received_at_human".to_string(), json!(ts_human_tr(recv)));
        }

        events.push(ev);
        if events.len() >= filter.limit {
            break;
        }
    }

    events
}

// =============================================================================
// POST /config (admin)
// =============================================================================

async fn update_config(
    _admin: AdminToken,
    State(state): State<Arc<AppState>>,
    Json(config): Json<RuntimeConfig>,
) -> Response {
    if let Err(detail) = config.validate() {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": detail}))).into_response();
    }

    if let Err(e) = config.save(state.store.as_ref()).await {
        return internal_error(e, "/config");
    }

    info!(
        watchlist = ?config.watchlist_symbols,
        threshold = config.threshold,
        "runtime config updated"
    );
    Json(config).into_response()
}

// =============================================================================
// DELETE /events/{symbol} (admin)
// =============================================================================

#[derive(Deserialize)]
struct DeleteEventQuery {
    event_id: String,
}

async fn delete_event(
    _admin: AdminToken,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DeleteEventQuery>,
) -> Response {
    let symbol = symbol.trim().to_uppercase();
    let key = events_key(&symbol);

    let entries = match state.store.lrange(&key, 0, -1).await {
        Ok(entries) => entries,
        Err(e) => return internal_error(e, "/events/{symbol}"),
    };

    let mut deleted = 0;
    for raw in &entries {
        let matches = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|ev| ev.get("event_id").and_then(Value::as_str).map(String::from))
            .is_some_and(|id| id == query.event_id);

        if matches {
            match state.store.lrem(&key, 0, raw).await {
                Ok(count) => deleted += count,
                Err(e) => return internal_error(e, "/events/{symbol}"),
            }
        }
    }

    info!(symbol = %symbol, event_id = %query.event_id, deleted, "event deleted");
    Json(json!({"deleted": deleted, "event_id": query.event_id})).into_response()
}

// =============================================================================
// Tests
// =============================================================================
