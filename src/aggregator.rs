// =============================================================================
// Aggregator -- collapse recent events into per-timeframe summaries
// =============================================================================
//
// For each configured timeframe the aggregator filters the tail of the
// symbol's event log to the window, accumulates signal counters, and keeps
// only the most recent signal per indicator (ties go to the later log entry).
// Corrupt log entries are skipped silently.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;

use crate::evaluation::{AggregationResult, IndicatorSignal, TimeframeSummary};
use crate::runtime_config::RuntimeConfig;
use crate::store::{events_key, KeyedStore};
use crate::types::{NormalizedEvent, SignalType};

/// Pure aggregation core over already-parsed events.
///
/// Deterministic for identical inputs: timeframes iterate in canonical order
/// and indicators keep first-seen order within a summary.
pub fn aggregate_events(
    symbol: &str,
    events: &[NormalizedEvent],
    config: &RuntimeConfig,
    now: i64,
) -> AggregationResult {
    let mut timeframes = BTreeMap::new();
    let mut used_events = Vec::new();

    for (&tf, &window_sec) in &config.tf_windows {
        let cutoff = now - window_sec as i64;
        let mut summary = TimeframeSummary::new(tf);
        // (indicator, latest event index) in first-seen order.
        let mut latest: Vec<(String, usize)> = Vec::new();

        for (idx, event) in events.iter().enumerate() {
            if event.tf != tf || event.ts < cutoff {
                continue;
            }

            match event.signal {
                SignalType::Buy => summary.buy_count += 1,
                SignalType::Sell => summary.sell_count += 1,
                SignalType::Close => summary.close_count += 1,
                SignalType::Neutral => summary.neutral_count += 1,
            }

            match latest.iter().position(|(name, _)| name == &event.indicator) {
                Some(pos) => {
                    // Ties go to the later log entry.
                    if event.ts >= events[latest[pos].1].ts {
                        latest[pos].1 = idx;
                    }
                }
                None => latest.push((event.indicator.clone(), idx)),
            }

            used_events.push(event.clone());
        }

        for (indicator, idx) in latest {
            let event = &events[idx];
            summary.indicators.push(IndicatorSignal {
                indicator,
                signal: event.signal,
                strength: event.strength,
                ts: event.ts,
            });
        }

        timeframes.insert(tf, summary);
    }

    AggregationResult {
        symbol: symbol.to_string(),
        timeframes,
        used_events,
        aggregated_at: now,
    }
}

/// Aggregate the tail of a symbol's stored event log.
pub async fn aggregate(
    store: &dyn KeyedStore,
    symbol: &str,
    config: &RuntimeConfig,
    max_events: usize,
) -> Result<AggregationResult> {
    let raw_events = store
        .lrange(&events_key(symbol), -(max_events as isize), -1)
        .await?;

    let events: Vec<NormalizedEvent> = raw_events
        .iter()
        .filter_map(|raw| serde_json::from_str(raw).ok())
        .collect();

    let now = chrono::Utc::now().timestamp();
    Ok(aggregate_events(symbol, &events, config, now))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Timeframe;

    const NOW: i64 = 1_700_000_000;

    fn event(indicator: &str, tf: Timeframe, signal: SignalType, strength: f64, ts: i64) -> NormalizedEvent {
        NormalizedEvent {
            event_id: format!("{indicator}-{ts}"),
            received_at: ts,
            ts,
            indicator: indicator.to_string(),
            symbol: "ETHUSDT".to_string(),
            tf,
            signal,
            strength,
            price: 3500.0,
            raw: serde_json::Map::new(),
        }
    }

    #[test]
    fn counts_signals_per_timeframe() {
        let config = RuntimeConfig::default();
        let events = vec![
            event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, NOW - 10),
            event("ChartPrime", Timeframe::M15, SignalType::Sell, 0.6, NOW - 20),
            event("BigBeluga", Timeframe::H1, SignalType::Buy, 0.9, NOW - 30),
        ];

        let agg = aggregate_events("ETHUSDT", &events, &config, NOW);

        let m15 = &agg.timeframes[&Timeframe::M15];
        assert_eq!(m15.buy_count, 1);
        assert_eq!(m15.sell_count, 1);
        assert_eq!(m15.indicators.len(), 2);

        let h1 = &agg.timeframes[&Timeframe::H1];
        assert_eq!(h1.buy_count, 1);
        assert_eq!(h1.indicators.len(), 1);

        assert_eq!(agg.timeframes[&Timeframe::H4].buy_count, 0);
        assert_eq!(agg.used_events.len(), 3);
    }

    #[test]
    fn window_cutoff_excludes_old_events() {
        let config = RuntimeConfig::default();
        // M15 window is 300 seconds.
        let events = vec![
            event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, NOW - 299),
            event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, NOW - 301),
        ];

        let agg = aggregate_events("ETHUSDT", &events, &config, NOW);
        assert_eq!(agg.timeframes[&Timeframe::M15].buy_count, 1);
        assert_eq!(agg.used_events.len(), 1);
    }

    #[test]
    fn latest_signal_per_indicator_wins() {
        let config = RuntimeConfig::default();
        let events = vec![
            event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, NOW - 100),
            event("BigBeluga", Timeframe::M15, SignalType::Sell, 0.4, NOW - 10),
        ];

        let agg = aggregate_events("ETHUSDT", &events, &config, NOW);
        let m15 = &agg.timeframes[&Timeframe::M15];
        assert_eq!(m15.indicators.len(), 1);
        assert_eq!(m15.indicators[0].signal, SignalType::Sell);
        assert!((m15.indicators[0].strength - 0.4).abs() < f64::EPSILON);
        // Counters still see both events.
        assert_eq!(m15.buy_count, 1);
        assert_eq!(m15.sell_count, 1);
    }

    #[test]
    fn equal_ts_prefers_later_log_entry() {
        let config = RuntimeConfig::default();
        let events = vec![
            event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, NOW - 10),
            event("BigBeluga", Timeframe::M15, SignalType::Sell, 0.3, NOW - 10),
        ];

        let agg = aggregate_events("ETHUSDT", &events, &config, NOW);
        assert_eq!(
            agg.timeframes[&Timeframe::M15].indicators[0].signal,
            SignalType::Sell
        );
    }

    #[test]
    fn indicator_order_is_first_seen() {
        let config = RuntimeConfig::default();
        let events = vec![
            event("Zeta", Timeframe::M15, SignalType::Buy, 0.8, NOW - 30),
            event("Alpha", Timeframe::M15, SignalType::Buy, 0.8, NOW - 20),
            event("Zeta", Timeframe::M15, SignalType::Buy, 0.8, NOW - 10),
        ];

        let agg = aggregate_events("ETHUSDT", &events, &config, NOW);
        let names: Vec<&str> = agg.timeframes[&Timeframe::M15]
            .indicators
            .iter()
            .map(|i| i.indicator.as_str())
            .collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
    }

    #[tokio::test]
    async fn store_wrapper_skips_corrupt_entries() {
        let store = MemoryStore::new();
        let config = RuntimeConfig::default();
        let good = event("BigBeluga", Timeframe::M15, SignalType::Buy, 0.8, chrono::Utc::now().timestamp());

        store
            .rpush("tv:events:ETHUSDT", &serde_json::to_string(&good).unwrap())
            .await
            .unwrap();
        store.rpush("tv:events:ETHUSDT", "{not json").await.unwrap();
        store
            .rpush("tv:events:ETHUSDT", "{\"tf\": \"99x\"}")
            .await
            .unwrap();

        let agg = aggregate(&store, "ETHUSDT", &config, 1000).await.unwrap();
        assert_eq!(agg.used_events.len(), 1);
        assert_eq!(agg.timeframes[&Timeframe::M15].buy_count, 1);
    }
}
