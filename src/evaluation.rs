// =============================================================================
// Evaluation types -- aggregation, rules output, two-layer latest envelope
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NormalizedEvent, SignalType, Timeframe};

// =============================================================================
// Aggregation
// =============================================================================

/// Most recent signal per indicator within an aggregation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSignal {
    pub indicator: String,
    pub signal: SignalType,
    pub strength: f64,
    pub ts: i64,
}

/// Per-timeframe signal counters plus the latest signal per indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSummary {
    pub tf: Timeframe,
    #[serde(default)]
    pub buy_count: u32,
    #[serde(default)]
    pub sell_count: u32,
    #[serde(default)]
    pub close_count: u32,
    #[serde(default)]
    pub neutral_count: u32,
    #[serde(default)]
    pub indicators: Vec<IndicatorSignal>,
}

impl TimeframeSummary {
    pub fn new(tf: Timeframe) -> Self {
        Self {
            tf,
            buy_count: 0,
            sell_count: 0,
            close_count: 0,
            neutral_count: 0,
            indicators: Vec::new(),
        }
    }
}

/// Windowed view over a symbol's event log.
///
/// `timeframes` is ordered (BTreeMap) so evaluation output, including reason
/// ordering, is deterministic for identical inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    pub symbol: String,
    pub timeframes: BTreeMap<Timeframe, TimeframeSummary>,
    pub used_events: Vec<NormalizedEvent>,
    pub aggregated_at: i64,
}

// =============================================================================
// Rules output
// =============================================================================

/// Gated trade recommendation produced by the rules engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "LONG_SETUP")]
    LongSetup,
    #[serde(rename = "SHORT_SETUP")]
    ShortSetup,
    #[serde(rename = "WATCH")]
    Watch,
    #[serde(rename = "NO_TRADE")]
    NoTrade,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongSetup => write!(f, "LONG_SETUP"),
            Self::ShortSetup => write!(f, "SHORT_SETUP"),
            Self::Watch => write!(f, "WATCH"),
            Self::NoTrade => write!(f, "NO_TRADE"),
        }
    }
}

/// Direction of aggregate pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Long,
    Short,
    Neutral,
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Deterministic rules engine output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesOutput {
    pub symbol: String,
    pub decision: Decision,
    pub bias: Bias,
    /// Integer confidence in [0, 100].
    pub confidence: u32,
    pub score: f64,
    pub threshold: f64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub veto_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veto_reason: Option<String>,
}

// =============================================================================
// Market summary (upstream data contract)
// =============================================================================

/// Condensed view of the last 20 candles of one interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub tf: Timeframe,
    pub last_price: f64,
    pub green_candles: u32,
    pub red_candles: u32,
    /// close[last] - close[first] over the summarized candles.
    pub slope: f64,
}

impl MarketSummary {
    /// Zero-valued placeholder used when the upstream fetch fails.
    pub fn empty(tf: Timeframe) -> Self {
        Self {
            tf,
            last_price: 0.0,
            green_candles: 0,
            red_candles: 0,
            slope: 0.0,
        }
    }
}

// =============================================================================
// Two-layer latest envelope
// =============================================================================

/// Signal counters per timeframe as published in the fast layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalCounts {
    pub buy: u32,
    pub sell: u32,
    pub close: u32,
    pub neutral: u32,
}

/// Fast layer: refreshed on every admission and scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestRules {
    pub decision: Decision,
    pub bias: Bias,
    pub confidence: u32,
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub signals_used: Vec<IndicatorSignal>,
    #[serde(default)]
    pub aggregated_counts: BTreeMap<Timeframe, SignalCounts>,
}

/// Slow layer: AI explanation, refreshed on its own cadence and carried
/// forward verbatim when a publication brings no new text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestAI {
    /// Up to 6 trimmed non-empty lines.
    #[serde(default)]
    pub lines: Vec<String>,
    pub generated_at: i64,
}

/// Publication envelope stored under `tv:latest:{symbol}`.
///
/// `evaluated_at` is monotonically non-decreasing per symbol; stale writers
/// self-abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestEvaluation {
    pub evaluation_id: String,
    pub symbol: String,
    pub latest_rules: LatestRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ai: Option<LatestAI>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_summary: Option<BTreeMap<Timeframe, MarketSummary>>,
    pub evaluated_at: i64,
}
