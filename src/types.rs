// =============================================================================
// Shared wire and event types for the Market Intelligence Service
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Signal
// =============================================================================

/// Canonical signal kind carried by a normalized event.
///
/// Only BUY / SELL (and the LONG / SHORT aliases) are accepted from the
/// webhook ingress. CLOSE and NEUTRAL exist for internal use and carry zero
/// directional weight in the rules engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
    Close,
    Neutral,
}

impl SignalType {
    /// Map an upstream alias to its canonical signal.
    ///
    /// `LONG`/`SHORT` fold into BUY/SELL; `EXIT`/`FLAT` fold into
    /// CLOSE/NEUTRAL for manual or future use.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw {
            "BUY" | "LONG" => Some(Self::Buy),
            "SELL" | "SHORT" => Some(Self::Sell),
            "CLOSE" | "EXIT" => Some(Self::Close),
            "NEUTRAL" | "FLAT" => Some(Self::Neutral),
            _ => None,
        }
    }

    /// Directional weight used by the rules engine.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Close | Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Close => write!(f, "CLOSE"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

// =============================================================================
// Timeframe
// =============================================================================

/// Candlestick resolution. The set is closed; aliases are resolved by the
/// normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Raw webhook payload
// =============================================================================

/// Raw TradingView webhook payload as received on the wire.
///
/// TradingView study alerts render ALL template placeholders as strings, so
/// `ts`, `price` and `strength` are accepted as arbitrary JSON values and
/// parsed downstream. Unknown fields are preserved in `extra` and re-emitted
/// under the event's `raw` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub secret: String,
    pub indicator: String,
    pub symbol: String,
    pub tf: String,
    pub signal: String,
    #[serde(default)]
    pub strength: Option<Value>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub ts: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// =============================================================================
// Normalized event
// =============================================================================

/// Canonical internal event representation. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// 16-hex-char identifier, supplied or derived from payload content.
    pub event_id: String,
    /// Server wall-clock seconds at admission.
    pub received_at: i64,
    /// Event wall-clock seconds (defaults to `received_at`).
    pub ts: i64,
    pub indicator: String,
    pub symbol: String,
    pub tf: Timeframe,
    pub signal: SignalType,
    /// Signal strength in [0, 1]; clamped at normalization.
    pub strength: f64,
    /// Last known price; 0.0 when neither payload nor fallback provided one.
    pub price: f64,
    /// Original payload with `secret` removed.
    pub raw: serde_json::Map<String, Value>,
}

// =============================================================================
// Webhook response
// =============================================================================

/// Body returned by `POST /tv-webhook`.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl WebhookResponse {
    pub fn duplicate(event_id: String) -> Self {
        Self {
            status: "duplicate",
            event_id,
            decision: None,
            bias: None,
            confidence: None,
            score: None,
            message: Some("duplicate event"),
        }
    }

    pub fn rate_limited(event_id: String) -> Self {
        Self {
            status: "rate_limited",
            event_id,
            decision: None,
            bias: None,
            confidence: None,
            score: None,
            message: Some("rate limit exceeded"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
