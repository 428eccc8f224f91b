// =============================================================================
// Runtime Configuration -- store-persisted, hot-swappable via POST /config
// =============================================================================
//
// Every tunable evaluation parameter lives here. The config is persisted in
// the keyed store (`tv:config`) so all replicas pick up admin changes without
// a restart; a missing or corrupt stored value falls back to the embedded
// defaults.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older stored config.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{KeyedStore, CONFIG_KEY};
use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_watchlist() -> Vec<String> {
    vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()]
}

fn default_refresh_rules_seconds() -> u64 {
    30
}

fn default_refresh_ai_seconds() -> u64 {
    120
}

fn default_events_max_per_symbol() -> usize {
    1000
}

fn default_tf_windows() -> BTreeMap<Timeframe, u64> {
    BTreeMap::from([
        (Timeframe::M5, 180),
        (Timeframe::M15, 300),
        (Timeframe::H1, 900),
        (Timeframe::H4, 1800),
    ])
}

fn default_tf_weights() -> BTreeMap<Timeframe, f64> {
    BTreeMap::from([
        (Timeframe::M5, 0.12),
        (Timeframe::M15, 0.18),
        (Timeframe::H1, 0.25),
        (Timeframe::H4, 0.45),
    ])
}

fn default_indicator_weights() -> HashMap<String, f64> {
    HashMap::from([("AdaptiveTrendFlow".to_string(), 1.0)])
}

fn default_threshold() -> f64 {
    0.25
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Runtime-adjustable parameters, persisted in the store as `tv:config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Watchlist & scheduler cadence --------------------------------------
    /// Symbols refreshed on schedule even without new alerts.
    #[serde(default = "default_watchlist")]
    pub watchlist_symbols: Vec<String>,

    /// Seconds between rules refreshes (floored at 5 by the scheduler).
    #[serde(default = "default_refresh_rules_seconds")]
    pub refresh_rules_seconds: u64,

    /// Target seconds between AI explanation refreshes.
    #[serde(default = "default_refresh_ai_seconds")]
    pub refresh_ai_seconds: u64,

    // --- Event store --------------------------------------------------------
    /// Maximum events kept per symbol (trim-to-tail on every admission).
    #[serde(default = "default_events_max_per_symbol")]
    pub events_max_per_symbol: usize,

    // --- Aggregation & scoring ----------------------------------------------
    /// Aggregation window per timeframe, in seconds.
    #[serde(default = "default_tf_windows")]
    pub tf_windows: BTreeMap<Timeframe, u64>,

    /// Timeframe weights. An unlisted timeframe contributes nothing.
    #[serde(default = "default_tf_weights")]
    pub tf_weights: BTreeMap<Timeframe, f64>,

    /// Indicator weight overrides. Unlisted indicators weigh 1.0.
    #[serde(default = "default_indicator_weights")]
    pub indicator_weights: HashMap<String, f64>,

    /// Score threshold for bias determination. Must be > 0 (the confidence
    /// formula divides by it).
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watchlist_symbols: default_watchlist(),
            refresh_rules_seconds: default_refresh_rules_seconds(),
            refresh_ai_seconds: default_refresh_ai_seconds(),
            events_max_per_symbol: default_events_max_per_symbol(),
            tf_windows: default_tf_windows(),
            tf_weights: default_tf_weights(),
            indicator_weights: default_indicator_weights(),
            threshold: default_threshold(),
        }
    }
}

impl RuntimeConfig {
    /// Load the active config from the store, falling back to defaults when
    /// the key is absent or unparsable.
    pub async fn load(store: &dyn KeyedStore) -> Result<Self> {
        match store.get(CONFIG_KEY).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!(error = %e, "stored runtime config is unparsable, using defaults");
                    Ok(Self::default())
                }
            },
            None => Ok(Self::default()),
        }
    }

    /// Persist this config as the new fleet-wide active config.
    pub async fn save(&self, store: &dyn KeyedStore) -> Result<()> {
        let json = serde_json::to_string(self)?;
        store.set(CONFIG_KEY, &json).await
    }

    /// Admin-facing validation run before a replacement config is accepted.
    pub fn validate(&self) -> Result<(), String> {
        if self.threshold <= 0.0 {
            return Err("threshold must be > 0".to_string());
        }
        Ok(())
    }
}
