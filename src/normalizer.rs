// =============================================================================
// Normalizer -- raw TradingView payloads into canonical NormalizedEvent
// =============================================================================
//
// TradingView indicator alerts (study, NOT strategy) send all placeholder
// values as strings. This module handles:
//   - symbol prefix removal   ("BINANCE:ETHUSDT" -> "ETHUSDT")
//   - tf normalization        ("60" -> "1h", "4H" -> "4h")
//   - signal strict check     (only BUY / SELL family accepted from alerts)
//   - ts / price string-to-number parsing
// =============================================================================

use chrono::NaiveDateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{NormalizedEvent, RawPayload, SignalType, Timeframe};

/// Signals accepted from TradingView indicator alerts. CLOSE / NEUTRAL (and
/// their aliases) are reserved for internal use.
const STRICT_SIGNALS: &[&str] = &["BUY", "SELL", "LONG", "SHORT"];

/// ISO formats TradingView's `{{timenow}}` placeholder is known to emit.
const TS_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Validation failure carrying a 400-level detail string for the ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeError {
    pub detail: String,
}

impl NormalizeError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Strip exchange prefix and contract suffix, return the uppercase symbol.
///
/// "BINANCE:ETHUSDT.P" -> "ETHUSDT". Idempotent.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s = raw.trim().to_uppercase();

    // Exchange prefix: one or more [A-Z0-9] followed by ':'.
    if let Some(idx) = s.find(':') {
        if idx > 0
            && s[..idx]
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            s = s[idx + 1..].to_string();
        }
    }

    // Contract suffix: '.' followed by one or more [A-Z] at the end (".P" on
    // perpetuals).
    if let Some(idx) = s.rfind('.') {
        let tail = &s[idx + 1..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_uppercase()) {
            s.truncate(idx);
        }
    }

    s
}

/// Normalize a timeframe alias. Returns the canonical form or `None`.
pub fn normalize_tf(raw: &str) -> Option<Timeframe> {
    let cleaned = raw.trim();
    match cleaned {
        "5" | "5m" => return Some(Timeframe::M5),
        "15" | "15m" => return Some(Timeframe::M15),
        "60" | "1h" | "1H" => return Some(Timeframe::H1),
        "240" | "4h" | "4H" => return Some(Timeframe::H4),
        _ => {}
    }
    match cleaned.to_ascii_lowercase().as_str() {
        "5m" => Some(Timeframe::M5),
        "15m" => Some(Timeframe::M15),
        "1h" => Some(Timeframe::H1),
        "4h" => Some(Timeframe::H4),
        _ => None,
    }
}

/// JSON null is treated the same as an absent field.
fn present(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|v| !v.is_null())
}

/// Parse an epoch-seconds integer from a JSON number or string; strings may
/// also carry an ISO datetime (interpreted as UTC).
fn parse_ts(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(n);
            }
            for fmt in TS_FORMATS {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(dt.and_utc().timestamp());
                }
            }
            None
        }
        _ => None,
    }
}

/// Parse a float from a JSON number or string.
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Render a raw JSON value for error messages and the hash key (strings
/// without their quotes).
fn display_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an optional raw value the way it participates in the hash key.
fn hash_part(value: &Option<Value>) -> String {
    present(value).map(display_raw).unwrap_or_default()
}

/// Deterministic event id: SHA-256 over the raw payload content (price is
/// included for uniqueness), truncated to the 64-bit hex prefix.
fn deterministic_event_id(payload: &RawPayload) -> String {
    let key = format!(
        "{}:{}:{}:{}:{}:{}",
        payload.indicator,
        payload.symbol,
        payload.tf,
        payload.signal,
        hash_part(&payload.ts),
        hash_part(&payload.price),
    );
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Normalize a webhook payload.
///
/// Returns the canonical event on success or a `NormalizeError` with a
/// human-readable detail on validation failure (the caller answers 400).
/// `fallback_price` is used when the payload carries no price.
pub fn normalize(payload: &RawPayload, fallback_price: f64) -> Result<NormalizedEvent, NormalizeError> {
    let now = chrono::Utc::now().timestamp();

    // Signal: strict whitelist first, then alias folding.
    let raw_signal = payload.signal.trim().to_uppercase();
    if !STRICT_SIGNALS.contains(&raw_signal.as_str()) {
        return Err(NormalizeError::new(format!(
            "Invalid signal: '{}'. Expected BUY or SELL.",
            payload.signal
        )));
    }
    let signal = SignalType::from_alias(&raw_signal).ok_or_else(|| {
        NormalizeError::new(format!("Unknown signal: '{}'", payload.signal))
    })?;

    // Timeframe.
    let tf = normalize_tf(&payload.tf)
        .ok_or_else(|| NormalizeError::new(format!("Invalid timeframe: '{}'", payload.tf)))?;

    // Symbol.
    let symbol = normalize_symbol(&payload.symbol);
    if symbol.is_empty() {
        return Err(NormalizeError::new("Empty symbol after normalization"));
    }

    // ts: a provided-but-unparsable value is an error; absent defaults to now.
    let ts = match present(&payload.ts) {
        Some(raw) => parse_ts(raw).ok_or_else(|| {
            NormalizeError::new(format!("Cannot parse ts as integer: '{}'", display_raw(raw)))
        })?,
        None => now,
    };

    // price: same error contract as ts; absent falls back to the caller's
    // last-known price.
    let price = match present(&payload.price) {
        Some(raw) => parse_number(raw).ok_or_else(|| {
            NormalizeError::new(format!("Cannot parse price as number: '{}'", display_raw(raw)))
        })?,
        None => fallback_price,
    };

    // strength: unparsable values silently default, parsed values clamp.
    let strength = present(&payload.strength)
        .and_then(parse_number)
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(0.5);

    let event_id = payload
        .event_id
        .clone()
        .unwrap_or_else(|| deterministic_event_id(payload));

    // Preserve the payload under `raw`, with the secret removed.
    let mut raw = match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    raw.remove("secret");

    Ok(NormalizedEvent {
        event_id,
        received_at: now,
        ts,
        indicator: payload.indicator.trim().to_string(),
        symbol,
        tf,
        signal,
        strength,
        price,
        raw,
    })
}

// =============================================================================
// Tests
// =============================================================================
