// =============================================================================
// Latest Publisher -- two-layer publication of rules (fast) and AI (slow)
// =============================================================================
//
// A publication that brings no new AI text carries the previous envelope's
// AI layer forward verbatim. Writes are gated on `evaluated_at`: a writer
// that observes a newer stored envelope drops its own write, keeping
// `evaluated_at` non-decreasing per symbol for every reader.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use crate::evaluation::{
    AggregationResult, LatestAI, LatestEvaluation, LatestRules, MarketSummary, RulesOutput,
    SignalCounts,
};
use crate::store::{latest_key, KeyedStore};
use crate::types::Timeframe;

/// Envelope lifetime (48 hours).
pub const LATEST_TTL_SECS: u64 = 172_800;

/// Maximum AI lines kept in the slow layer.
const MAX_AI_LINES: usize = 6;

/// Build the fast layer from a rules verdict and its aggregation.
pub fn build_latest_rules(rules: &RulesOutput, aggregation: &AggregationResult) -> LatestRules {
    let mut signals_used = Vec::new();
    let mut aggregated_counts = BTreeMap::new();

    for (tf, summary) in &aggregation.timeframes {
        signals_used.extend(summary.indicators.iter().cloned());
        aggregated_counts.insert(
            *tf,
            SignalCounts {
                buy: summary.buy_count,
                sell: summary.sell_count,
                close: summary.close_count,
                neutral: summary.neutral_count,
            },
        );
    }

    LatestRules {
        decision: rules.decision,
        bias: rules.bias,
        confidence: rules.confidence,
        score: rules.score,
        reasons: rules.reasons.clone(),
        signals_used,
        aggregated_counts,
    }
}

/// Trim AI text into the slow layer: up to 6 non-empty lines.
fn ai_layer(ai_text: &str, now: i64) -> LatestAI {
    let lines = ai_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(MAX_AI_LINES)
        .map(str::to_string)
        .collect();
    LatestAI {
        lines,
        generated_at: now,
    }
}

/// Persist the two-layer latest evaluation for `symbol`.
pub async fn store_latest(
    store: &dyn KeyedStore,
    symbol: &str,
    rules: &RulesOutput,
    aggregation: &AggregationResult,
    market: Option<&BTreeMap<Timeframe, MarketSummary>>,
    ai_text: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let key = latest_key(symbol);

    let latest_rules = build_latest_rules(rules, aggregation);

    // One read serves both the AI carry-forward and the monotonicity gate.
    // A corrupt stored envelope is treated as absent.
    let previous: Option<LatestEvaluation> = match store.get(&key).await? {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };

    let latest_ai = match ai_text {
        Some(text) if !text.trim().is_empty() => Some(ai_layer(text, now)),
        _ => previous.as_ref().and_then(|prev| prev.latest_ai.clone()),
    };

    if let Some(prev) = &previous {
        if prev.evaluated_at > now {
            debug!(symbol, prev = prev.evaluated_at, now, "stale latest write dropped");
            return Ok(());
        }
    }

    let envelope = LatestEvaluation {
        evaluation_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
        symbol: symbol.to_string(),
        latest_rules,
        latest_ai,
        market_summary: market.filter(|m| !m.is_empty()).cloned(),
        evaluated_at: now,
    };

    store
        .set_ex(&key, &serde_json::to_string(&envelope)?, LATEST_TTL_SECS)
        .await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{Bias, Decision, IndicatorSignal, TimeframeSummary};
    use crate::store::MemoryStore;
    use crate::types::SignalType;

    fn rules() -> RulesOutput {
        RulesOutput {
            symbol: "ETHUSDT".to_string(),
            decision: Decision::LongSetup,
            bias: Bias::Long,
            confidence: 80,
            score: 0.4,
            threshold: 0.25,
            reasons: vec!["BigBeluga@4h: BUY (str=0.9, contrib=+0.405)".to_string()],
            veto_applied: false,
            veto_reason: None,
        }
    }

    fn aggregation() -> AggregationResult {
        let mut summary = TimeframeSummary::new(Timeframe::H4);
        summary.buy_count = 1;
        summary.indicators.push(IndicatorSignal {
            indicator: "BigBeluga".to_string(),
            signal: SignalType::Buy,
            strength: 0.9,
            ts: 1_700_000_000,
        });

        AggregationResult {
            symbol: "ETHUSDT".to_string(),
            timeframes: BTreeMap::from([(Timeframe::H4, summary)]),
            used_events: vec![],
            aggregated_at: 1_700_000_000,
        }
    }

    async fn read_envelope(store: &MemoryStore) -> LatestEvaluation {
        let raw = store.get("tv:latest:ETHUSDT").await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn fast_layer_collects_counts_and_signals() {
        let lr = build_latest_rules(&rules(), &aggregation());
        assert_eq!(lr.decision, Decision::LongSetup);
        assert_eq!(lr.signals_used.len(), 1);
        assert_eq!(lr.aggregated_counts[&Timeframe::H4].buy, 1);
        assert_eq!(lr.aggregated_counts[&Timeframe::H4].sell, 0);
    }

    #[tokio::test]
    async fn publishes_envelope_with_ttl() {
        let store = MemoryStore::new();
        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, None)
            .await
            .unwrap();

        let envelope = read_envelope(&store).await;
        assert_eq!(envelope.symbol, "ETHUSDT");
        assert_eq!(envelope.evaluation_id.len(), 12);
        assert!(envelope.latest_ai.is_none());
        assert!(envelope.market_summary.is_none());
        assert_eq!(store.ttl_secs("tv:latest:ETHUSDT"), Some(LATEST_TTL_SECS));
    }

    #[tokio::test]
    async fn ai_text_is_trimmed_to_six_lines() {
        let store = MemoryStore::new();
        let text = "1\n\n  2  \n3\n4\n5\n6\n7\n8";
        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, Some(text))
            .await
            .unwrap();

        let ai = read_envelope(&store).await.latest_ai.unwrap();
        assert_eq!(ai.lines, vec!["1", "2", "3", "4", "5", "6"]);
        assert!(ai.generated_at > 0);
    }

    #[tokio::test]
    async fn missing_ai_carries_previous_layer_forward() {
        let store = MemoryStore::new();
        store_latest(
            &store,
            "ETHUSDT",
            &rules(),
            &aggregation(),
            None,
            Some("first explanation"),
        )
        .await
        .unwrap();
        let first = read_envelope(&store).await;

        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, None)
            .await
            .unwrap();
        let second = read_envelope(&store).await;

        let prev_ai = first.latest_ai.unwrap();
        let kept_ai = second.latest_ai.unwrap();
        assert_eq!(kept_ai.lines, prev_ai.lines);
        assert_eq!(kept_ai.generated_at, prev_ai.generated_at);
        // The fast layer still re-published.
        assert_ne!(second.evaluation_id, first.evaluation_id);
    }

    #[tokio::test]
    async fn corrupt_previous_envelope_treated_as_absent() {
        let store = MemoryStore::new();
        store.set("tv:latest:ETHUSDT", "{broken").await.unwrap();

        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, None)
            .await
            .unwrap();
        let envelope = read_envelope(&store).await;
        assert!(envelope.latest_ai.is_none());
    }

    #[tokio::test]
    async fn stale_writer_aborts() {
        let store = MemoryStore::new();
        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, None)
            .await
            .unwrap();

        // Simulate a newer writer having already published.
        let mut future_envelope = read_envelope(&store).await;
        future_envelope.evaluated_at = chrono::Utc::now().timestamp() + 3600;
        future_envelope.evaluation_id = "future000000".to_string();
        store
            .set(
                "tv:latest:ETHUSDT",
                &serde_json::to_string(&future_envelope).unwrap(),
            )
            .await
            .unwrap();

        store_latest(&store, "ETHUSDT", &rules(), &aggregation(), None, None)
            .await
            .unwrap();

        let kept = read_envelope(&store).await;
        assert_eq!(kept.evaluation_id, "future000000");
        assert_eq!(kept.evaluated_at, future_envelope.evaluated_at);
    }

    #[tokio::test]
    async fn market_summaries_are_published() {
        let store = MemoryStore::new();
        let market = BTreeMap::from([(
            Timeframe::H1,
            MarketSummary {
                tf: Timeframe::H1,
                last_price: 3500.0,
                green_candles: 12,
                red_candles: 8,
                slope: 10.0,
            },
        )]);

        store_latest(
            &store,
            "ETHUSDT",
            &rules(),
            &aggregation(),
            Some(&market),
            None,
        )
        .await
        .unwrap();

        let envelope = read_envelope(&store).await;
        let published = envelope.market_summary.unwrap();
        assert!((published[&Timeframe::H1].last_price - 3500.0).abs() < f64::EPSILON);
    }
}
