// =============================================================================
// Webhook ingress -- POST /tv-webhook
// =============================================================================
//
// Pipeline per request:
//   ParseBody -> CheckSecret -> Normalize -> Dedupe -> RateLimit -> Persist
//   -> AggregateEvaluate -> PublishFast -> Respond
//
// The fast layer is published before the HTTP response. Market data and the
// AI explanation run afterwards in a background task gated by the per-symbol
// single-flight lock; background failures never reach the client.
//
// TradingView sends `Content-Type: text/plain`, so the body is taken as a
// raw string and parsed as JSON regardless of the header.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info, warn};

use crate::aggregator::aggregate;
use crate::app_state::AppState;
use crate::dedup::{is_duplicate, rate_limit_exceeded};
use crate::evaluation::{AggregationResult, RulesOutput};
use crate::locks::{acquire_ai_lock, release_ai_lock};
use crate::normalizer::{normalize, normalize_symbol};
use crate::publisher::store_latest;
use crate::rules_engine::evaluate;
use crate::runtime_config::RuntimeConfig;
use crate::store::events_key;
use crate::types::{RawPayload, WebhookResponse};

/// Event log lifetime (24 hours), refreshed on every admission.
pub const EVENT_TTL_SECS: u64 = 86_400;

/// Work handed to the background task after an admission.
pub struct BackgroundWork {
    pub symbol: String,
    pub rules: RulesOutput,
    pub aggregation: AggregationResult,
}

/// Terminal result of the ingress pipeline.
pub enum WebhookOutcome {
    InvalidJson,
    SchemaError(String),
    InvalidSecret,
    NormalizeFailed(String),
    /// Soft or full acceptance; `background` is present only on `accepted`.
    Processed {
        response: WebhookResponse,
        background: Option<BackgroundWork>,
    },
}

/// Run the full ingress pipeline. Store failures bubble up as `Err` and map
/// to a 500 at the handler.
pub async fn process_webhook(state: &AppState, body: &str) -> Result<WebhookOutcome> {
    // ParseBody: JSON first, then schema.
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Ok(WebhookOutcome::InvalidJson);
    };
    let payload: RawPayload = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(e) => return Ok(WebhookOutcome::SchemaError(e.to_string())),
    };

    // CheckSecret.
    if payload.secret != state.settings.tv_webhook_secret {
        warn!(indicator = %payload.indicator, symbol = %payload.symbol, "invalid webhook secret");
        return Ok(WebhookOutcome::InvalidSecret);
    }

    let store = state.store.as_ref();

    // Normalize, with a last-price fallback when the payload has no price.
    let fallback_price = if payload.price.as_ref().map_or(true, |v| v.is_null()) {
        state
            .market
            .get_last_price(&normalize_symbol(&payload.symbol))
            .await
    } else {
        0.0
    };

    let event = match normalize(&payload, fallback_price) {
        Ok(event) => event,
        Err(e) => return Ok(WebhookOutcome::NormalizeFailed(e.detail)),
    };

    // Dedupe.
    if is_duplicate(store, &event.event_id).await? {
        info!(event_id = %event.event_id, "duplicate event");
        return Ok(WebhookOutcome::Processed {
            response: WebhookResponse::duplicate(event.event_id),
            background: None,
        });
    }

    // RateLimit.
    let now = chrono::Utc::now().timestamp();
    if rate_limit_exceeded(
        store,
        &event.symbol,
        state.settings.rate_limit_window_sec,
        state.settings.rate_limit_max_events,
        now,
    )
    .await?
    {
        return Ok(WebhookOutcome::Processed {
            response: WebhookResponse::rate_limited(event.event_id),
            background: None,
        });
    }

    // Persist: append, trim to tail, refresh TTL.
    let config = RuntimeConfig::load(store).await?;
    let key = events_key(&event.symbol);
    store.rpush(&key, &serde_json::to_string(&event)?).await?;
    store
        .ltrim(&key, -(config.events_max_per_symbol as isize), -1)
        .await?;
    store.expire(&key, EVENT_TTL_SECS).await?;

    info!(
        event_id = %event.event_id,
        indicator = %event.indicator,
        symbol = %event.symbol,
        tf = %event.tf,
        signal = %event.signal,
        "event stored"
    );

    // AggregateEvaluate + PublishFast (before the response; the AI layer of
    // the previous envelope is carried forward).
    let aggregation = aggregate(store, &event.symbol, &config, config.events_max_per_symbol).await?;
    let rules = evaluate(&aggregation, &config);
    store_latest(store, &event.symbol, &rules, &aggregation, None, None).await?;

    let response = WebhookResponse {
        status: "accepted",
        event_id: event.event_id,
        decision: Some(rules.decision.to_string()),
        bias: Some(rules.bias.to_string()),
        confidence: Some(rules.confidence),
        score: Some(rules.score),
        message: None,
    };

    Ok(WebhookOutcome::Processed {
        response,
        background: Some(BackgroundWork {
            symbol: event.symbol,
            rules,
            aggregation,
        }),
    })
}

/// Background leg: market summaries, AI under the single-flight lock, slow
/// publication. Never surfaces errors to the request that spawned it.
pub async fn background_evaluation(state: Arc<AppState>, work: BackgroundWork) {
    if let Err(e) = try_background_evaluation(&state, &work).await {
        error!(symbol = %work.symbol, error = %e, "background evaluation error");
    }
}

async fn try_background_evaluation(state: &AppState, work: &BackgroundWork) -> Result<()> {
    let store = state.store.as_ref();

    let market = state.market.get_market_summaries(&work.symbol).await;

    let mut ai_text = None;
    match acquire_ai_lock(store, &work.symbol).await? {
        Some(token) => {
            ai_text = Some(
                state
                    .ai
                    .explain(&work.rules, &work.aggregation, &market)
                    .await,
            );
            release_ai_lock(store, &work.symbol, &token).await?;
        }
        None => info!(symbol = %work.symbol, "ai lock busy, skipping explanation"),
    }

    store_latest(
        store,
        &work.symbol,
        &work.rules,
        &work.aggregation,
        Some(&market),
        ai_text.as_deref(),
    )
    .await?;

    info!(symbol = %work.symbol, decision = %work.rules.decision, "evaluation stored");
    Ok(())
}

/// Axum handler for `POST /tv-webhook`.
pub async fn tv_webhook(State(state): State<Arc<AppState>>, body: String) -> Response {
    match process_webhook(&state, &body).await {
        Ok(WebhookOutcome::InvalidJson) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"detail": "Invalid JSON body"})),
        )
            .into_response(),
        Ok(WebhookOutcome::SchemaError(detail)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"detail": detail})),
        )
            .into_response(),
        Ok(WebhookOutcome::InvalidSecret) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "Invalid secret"})),
        )
            .into_response(),
        Ok(WebhookOutcome::NormalizeFailed(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"detail": detail})),
        )
            .into_response(),
        Ok(WebhookOutcome::Processed {
            response,
            background,
        }) => {
            if let Some(work) = background {
                let bg_state = state.clone();
                state.spawn_background(background_evaluation(bg_state, work));
            }
            Json(response).into_response()
        }
        Err(e) => {
            error!(error = %e, path = "/tv-webhook", "unhandled ingress error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"detail": "Internal server error"})),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn state() -> AppState {
        AppState::new(Settings::test_defaults(), Arc::new(MemoryStore::new()))
    }

    fn payload_json(event_id: &str) -> String {
        json!({
            "secret": "test_secret",
            "indicator": "BigBeluga",
            "symbol": "ETHUSDT",
            "tf": "15m",
            "signal": "BUY",
            "strength": 0.8,
            "price": 3500.0,
            "event_id": event_id,
        })
        .to_string()
    }

    async fn expect_processed(state: &AppState, body: &str) -> WebhookResponse {
        match process_webhook(state, body).await.unwrap() {
            WebhookOutcome::Processed { response, .. } => response,
            _ => panic!("expected a processed outcome"),
        }
    }

    #[tokio::test]
    async fn valid_payload_is_accepted_with_rules_result() {
        let state = state();
        let response = expect_processed(&state, &payload_json("evt_001")).await;

        assert_eq!(response.status, "accepted");
        assert_eq!(response.event_id, "evt_001");
        assert!(response.decision.is_some());
        assert!(response.bias.is_some());
        assert!(response.confidence.is_some());

        // The event is persisted with the log TTL.
        let stored = state
            .store
            .lrange("tv:events:ETHUSDT", 0, -1)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].contains("evt_001"));
    }

    #[tokio::test]
    async fn accepted_event_publishes_fast_layer_before_response() {
        let state = state();
        expect_processed(&state, &payload_json("evt_fast")).await;

        let raw = state
            .store
            .get("tv:latest:ETHUSDT")
            .await
            .unwrap()
            .expect("fast layer must be published synchronously");
        let envelope: crate::evaluation::LatestEvaluation = serde_json::from_str(&raw).unwrap();
        assert!(envelope.latest_ai.is_none());
        assert_eq!(envelope.symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let state = state();
        let body = json!({
            "secret": "wrong_secret",
            "indicator": "BigBeluga",
            "symbol": "ETHUSDT",
            "tf": "15m",
            "signal": "BUY",
            "price": 1.0,
        })
        .to_string();

        assert!(matches!(
            process_webhook(&state, &body).await.unwrap(),
            WebhookOutcome::InvalidSecret
        ));
        // No state change.
        assert_eq!(state.store.llen("tv:events:ETHUSDT").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_body_and_schema_are_distinguished() {
        let state = state();

        assert!(matches!(
            process_webhook(&state, "{not json").await.unwrap(),
            WebhookOutcome::InvalidJson
        ));

        let outcome = process_webhook(&state, r#"{"secret": "test_secret"}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::SchemaError(_)));
    }

    #[tokio::test]
    async fn invalid_timeframe_reports_normalizer_detail() {
        let state = state();
        let body = json!({
            "secret": "test_secret",
            "indicator": "BigBeluga",
            "symbol": "ETHUSDT",
            "tf": "3h",
            "signal": "BUY",
            "price": 1.0,
        })
        .to_string();

        match process_webhook(&state, &body).await.unwrap() {
            WebhookOutcome::NormalizeFailed(detail) => {
                assert!(detail.contains("Invalid timeframe"));
            }
            _ => panic!("expected a normalize failure"),
        }
    }

    #[tokio::test]
    async fn duplicate_event_is_soft_accepted_once() {
        let state = state();

        let first = expect_processed(&state, &payload_json("evt_dup")).await;
        assert_eq!(first.status, "accepted");

        let second = expect_processed(&state, &payload_json("evt_dup")).await;
        assert_eq!(second.status, "duplicate");

        // The log still holds exactly one copy.
        assert_eq!(state.store.llen("tv:events:ETHUSDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limited_event_is_soft_accepted_without_persist() {
        let mut settings = Settings::test_defaults();
        settings.rate_limit_max_events = 2;
        // A wide window keeps all three calls in one bucket.
        settings.rate_limit_window_sec = 3600;
        let state = AppState::new(settings, Arc::new(MemoryStore::new()));

        for i in 0..2 {
            let response = expect_processed(&state, &payload_json(&format!("evt_rl_{i}"))).await;
            assert_eq!(response.status, "accepted");
        }

        let response = expect_processed(&state, &payload_json("evt_rl_over")).await;
        assert_eq!(response.status, "rate_limited");
        assert_eq!(state.store.llen("tv:events:ETHUSDT").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn exchange_prefix_is_stripped_before_storage() {
        let state = state();
        let body = json!({
            "secret": "test_secret",
            "indicator": "BigBeluga",
            "symbol": "BINANCE:ETHUSDT.P",
            "tf": "15m",
            "signal": "BUY",
            "price": 3500.0,
            "event_id": "evt_prefix",
        })
        .to_string();

        expect_processed(&state, &body).await;
        assert_eq!(state.store.llen("tv:events:ETHUSDT").await.unwrap(), 1);
        assert_eq!(
            state.store.llen("tv:events:BINANCE:ETHUSDT.P").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn event_log_is_trimmed_to_config_maximum() {
        let state = state();

        // Shrink the cap via the stored config.
        let mut config = RuntimeConfig::default();
        config.events_max_per_symbol = 5;
        config.save(state.store.as_ref()).await.unwrap();

        for i in 0..8 {
            let response = expect_processed(&state, &payload_json(&format!("evt_trim_{i}"))).await;
            assert_eq!(response.status, "accepted");
        }

        assert_eq!(state.store.llen("tv:events:ETHUSDT").await.unwrap(), 5);
        let stored = state
            .store
            .lrange("tv:events:ETHUSDT", 0, -1)
            .await
            .unwrap();
        assert!(stored[0].contains("evt_trim_3"));
        assert!(stored[4].contains("evt_trim_7"));
    }

    #[tokio::test]
    async fn background_work_is_returned_only_on_accept() {
        let state = state();
        match process_webhook(&state, &payload_json("evt_bg")).await.unwrap() {
            WebhookOutcome::Processed {
                background: Some(work),
                ..
            } => {
                assert_eq!(work.symbol, "ETHUSDT");
            }
            _ => panic!("expected background work on accept"),
        }

        match process_webhook(&state, &payload_json("evt_bg")).await.unwrap() {
            WebhookOutcome::Processed { background, .. } => assert!(background.is_none()),
            _ => panic!("expected a processed outcome"),
        }
    }
}
