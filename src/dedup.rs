// =============================================================================
// Deduplication and per-symbol rate limiting
// =============================================================================
//
// Dedupe is an atomic set-if-absent on `tv:dedupe:{event_id}` with a 10
// minute TTL: the first writer admits the event, every later writer within
// the window sees a duplicate.
//
// The rate limiter counts admissions per `floor(now / window)` bucket. Bucket
// keys expire after two windows, which approximates a sliding window with at
// most two live buckets per symbol.
// =============================================================================

use anyhow::Result;
use tracing::warn;

use crate::store::{dedupe_key, rate_key, KeyedStore};

/// Dedupe marker lifetime (10 minutes).
pub const DEDUPE_TTL_SECS: u64 = 600;

/// Record `event_id` and report whether it was already seen within the
/// dedupe window.
pub async fn is_duplicate(store: &dyn KeyedStore, event_id: &str) -> Result<bool> {
    let fresh = store
        .set_nx_ex(&dedupe_key(event_id), "1", DEDUPE_TTL_SECS)
        .await?;
    Ok(!fresh)
}

/// Count one admission for `symbol` and report whether the symbol has
/// exceeded `max_events` within the current window.
pub async fn rate_limit_exceeded(
    store: &dyn KeyedStore,
    symbol: &str,
    window_sec: u64,
    max_events: u32,
    now: i64,
) -> Result<bool> {
    let bucket = now / window_sec as i64;
    let key = rate_key(symbol, bucket);

    let count = store.incr(&key).await?;
    if count == 1 {
        store.expire(&key, window_sec * 2).await?;
    }

    if count > i64::from(max_events) {
        warn!(symbol, count, window = window_sec, "rate limit exceeded");
        return Ok(true);
    }
    Ok(false)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn first_sighting_is_not_duplicate() {
        let store = MemoryStore::new();
        assert!(!is_duplicate(&store, "evt_001").await.unwrap());
        assert!(is_duplicate(&store, "evt_001").await.unwrap());
        assert!(!is_duplicate(&store, "evt_002").await.unwrap());
    }

    #[tokio::test]
    async fn dedupe_marker_carries_ttl() {
        let store = MemoryStore::new();
        is_duplicate(&store, "evt_ttl").await.unwrap();
        assert_eq!(store.ttl_secs("tv:dedupe:evt_ttl"), Some(DEDUPE_TTL_SECS));
    }

    #[tokio::test]
    async fn rate_limit_trips_above_max() {
        let store = MemoryStore::new();
        let now = 1_700_000_000;
        for _ in 0..3 {
            assert!(!rate_limit_exceeded(&store, "ETHUSDT", 10, 3, now)
                .await
                .unwrap());
        }
        assert!(rate_limit_exceeded(&store, "ETHUSDT", 10, 3, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rate_buckets_are_per_symbol_and_window() {
        let store = MemoryStore::new();
        let now = 1_700_000_000;
        assert!(!rate_limit_exceeded(&store, "ETHUSDT", 10, 1, now)
            .await
            .unwrap());
        // A different symbol has its own bucket.
        assert!(!rate_limit_exceeded(&store, "BTCUSDT", 10, 1, now)
            .await
            .unwrap());
        // Same symbol in the same bucket trips.
        assert!(rate_limit_exceeded(&store, "ETHUSDT", 10, 1, now)
            .await
            .unwrap());
        // The next window starts a fresh bucket.
        assert!(!rate_limit_exceeded(&store, "ETHUSDT", 10, 1, now + 10)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rate_bucket_ttl_spans_two_windows() {
        let store = MemoryStore::new();
        let now = 1_700_000_000;
        rate_limit_exceeded(&store, "ETHUSDT", 10, 30, now)
            .await
            .unwrap();
        let bucket = now / 10;
        assert_eq!(store.ttl_secs(&format!("tv:rate:ETHUSDT:{bucket}")), Some(20));
    }
}
