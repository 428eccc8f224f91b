// =============================================================================
// Market data -- Binance Futures klines with a short in-memory cache
// =============================================================================
//
// Summaries condense the last 20 candles of each interval into last price,
// green/red counts and a close-to-close slope. Fetch failures degrade to
// zero-valued summaries; callers never see an error from the summary path.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error};

use crate::evaluation::MarketSummary;
use crate::types::Timeframe;

const BINANCE_FAPI: &str = "https://fapi.binance.com/fapi/v1/klines";

/// How long a fetched kline series stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(10);

/// Intervals summarized for evaluations.
const SUMMARY_INTERVALS: [Timeframe; 3] = [Timeframe::M15, Timeframe::H1, Timeframe::H4];

/// Klines client with a per-(symbol, interval) cache.
pub struct MarketDataClient {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, (Instant, Vec<Value>)>>,
}

impl MarketDataClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch raw klines for one (symbol, interval), serving from cache when
    /// fresh. Each kline row is the upstream JSON array.
    async fn fetch_klines(&self, symbol: &str, interval: Timeframe, limit: u32) -> Result<Vec<Value>> {
        let cache_key = format!("{symbol}:{interval}");

        {
            let cache = self.cache.lock();
            if let Some((fetched_at, rows)) = cache.get(&cache_key) {
                if fetched_at.elapsed() < CACHE_TTL {
                    return Ok(rows.clone());
                }
            }
        }

        let limit = limit.to_string();
        let resp = self
            .http
            .get(BINANCE_FAPI)
            .query(&[
                ("symbol", symbol),
                ("interval", interval.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .context("klines request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("klines request returned {status}");
        }

        let rows: Vec<Value> = resp.json().await.context("klines response is not JSON")?;
        debug!(symbol, interval = %interval, rows = rows.len(), "klines fetched");

        self.cache
            .lock()
            .insert(cache_key, (Instant::now(), rows.clone()));

        Ok(rows)
    }

    /// Summaries for 15m / 1h / 4h. A failed interval yields a zero-valued
    /// placeholder so evaluation can always proceed.
    pub async fn get_market_summaries(&self, symbol: &str) -> BTreeMap<Timeframe, MarketSummary> {
        let fetches = SUMMARY_INTERVALS.map(|iv| self.fetch_klines(symbol, iv, 200));
        let results = futures_util::future::join_all(fetches).await;

        let mut out = BTreeMap::new();
        for (interval, result) in SUMMARY_INTERVALS.into_iter().zip(results) {
            let summary = match result {
                Ok(rows) => summarize(&rows, interval),
                Err(e) => {
                    error!(symbol, interval = %interval, error = %e, "klines fetch error");
                    MarketSummary::empty(interval)
                }
            };
            out.insert(interval, summary);
        }
        out
    }

    /// Last 15m close for `symbol`; 0.0 when nothing is available.
    pub async fn get_last_price(&self, symbol: &str) -> f64 {
        match self.fetch_klines(symbol, Timeframe::M15, 1).await {
            Ok(rows) => rows.last().and_then(|row| kline_close(row)).unwrap_or(0.0),
            Err(e) => {
                error!(symbol, error = %e, "last price fetch error");
                0.0
            }
        }
    }
}

impl Default for MarketDataClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Kline rows carry numeric fields as JSON strings ("3500.00").
fn kline_field(row: &Value, idx: usize) -> Option<f64> {
    match row.get(idx)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn kline_open(row: &Value) -> Option<f64> {
    kline_field(row, 1)
}

fn kline_close(row: &Value) -> Option<f64> {
    kline_field(row, 4)
}

/// Condense a kline series into a `MarketSummary` over its last 20 candles.
pub fn summarize(rows: &[Value], tf: Timeframe) -> MarketSummary {
    if rows.is_empty() {
        return MarketSummary::empty(tf);
    }

    let last_price = rows.last().and_then(kline_close).unwrap_or(0.0);

    let start = rows.len().saturating_sub(20);
    let window = &rows[start..];

    let mut green = 0u32;
    for row in window {
        let open = kline_open(row).unwrap_or(0.0);
        let close = kline_close(row).unwrap_or(0.0);
        if close >= open {
            green += 1;
        }
    }
    let red = window.len() as u32 - green;

    let first_close = window.first().and_then(kline_close).unwrap_or(0.0);
    let last_close = window.last().and_then(kline_close).unwrap_or(0.0);
    let slope = ((last_close - first_close) * 10_000.0).round() / 10_000.0;

    MarketSummary {
        tf,
        last_price,
        green_candles: green,
        red_candles: red,
        slope,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Minimal kline row: [open_time, open, high, low, close, ...].
    fn row(open: f64, close: f64) -> Value {
        json!([
            1_700_000_000_000_i64,
            open.to_string(),
            "0",
            "0",
            close.to_string(),
            "123.4"
        ])
    }

    #[test]
    fn empty_series_yields_zero_summary() {
        let summary = summarize(&[], Timeframe::H1);
        assert_eq!(summary.last_price, 0.0);
        assert_eq!(summary.green_candles, 0);
        assert_eq!(summary.red_candles, 0);
        assert_eq!(summary.slope, 0.0);
    }

    #[test]
    fn counts_green_and_red_candles() {
        let rows = vec![
            row(100.0, 101.0), // green
            row(101.0, 100.5), // red
            row(100.5, 100.5), // doji counts green (close >= open)
            row(100.5, 102.0), // green
        ];
        let summary = summarize(&rows, Timeframe::M15);
        assert_eq!(summary.green_candles, 3);
        assert_eq!(summary.red_candles, 1);
        assert!((summary.last_price - 102.0).abs() < f64::EPSILON);
        // slope = 102.0 - 101.0 (first close in window)
        assert!((summary.slope - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_window_is_last_twenty() {
        let mut rows: Vec<Value> = (0..30)
            .map(|i| row(100.0 + i as f64, 100.0 + i as f64))
            .collect();
        rows.push(row(200.0, 150.0));

        let summary = summarize(&rows, Timeframe::H4);
        // Window covers the last 20 rows, so the first close is row 11's.
        assert!((summary.slope - (150.0 - 111.0)).abs() < f64::EPSILON);
        assert_eq!(summary.green_candles + summary.red_candles, 20);
    }

    #[test]
    fn string_and_numeric_fields_both_parse() {
        let string_row = json!([0, "100.5", "0", "0", "101.5", "1"]);
        let numeric_row = json!([0, 100.5, 0, 0, 101.5, 1]);
        assert_eq!(kline_close(&string_row), Some(101.5));
        assert_eq!(kline_close(&numeric_row), Some(101.5));
        assert_eq!(kline_open(&string_row), Some(100.5));
    }
}
