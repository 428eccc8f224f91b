// =============================================================================
// AI explanation client -- provider variants behind one explain() surface
// =============================================================================
//
// The provider is selected once at startup and never hot-swapped. Every
// provider, including the OpenAI-compatible HTTP one, resolves to text: any
// upstream failure falls back to the deterministic template so an
// explanation is always available and `explain` never returns an error.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::error;

use crate::evaluation::{AggregationResult, MarketSummary, RulesOutput};
use crate::settings::Settings;
use crate::types::Timeframe;

/// Upper bound on a single provider call.
const AI_TIMEOUT: Duration = Duration::from_secs(15);

/// AI explanation provider. `Dummy` renders the fallback template locally;
/// `OpenAi` calls any OpenAI-compatible chat completions endpoint.
pub enum AiClient {
    Dummy,
    OpenAi(OpenAiClient),
}

impl AiClient {
    /// Select the provider from settings. "openai" requires an API key;
    /// anything else (or a missing key) yields the dummy provider.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.ai_provider == "openai" && !settings.ai_api_key.is_empty() {
            Self::OpenAi(OpenAiClient::new(
                &settings.ai_api_key,
                &settings.ai_model,
                &settings.ai_base_url,
            ))
        } else {
            Self::Dummy
        }
    }

    /// Produce a short analyst explanation for the given evaluation.
    pub async fn explain(
        &self,
        rules: &RulesOutput,
        aggregation: &AggregationResult,
        market: &BTreeMap<Timeframe, MarketSummary>,
    ) -> String {
        match self {
            Self::Dummy => fallback_explanation(rules, aggregation, market),
            Self::OpenAi(client) => match client.complete(rules, aggregation, market).await {
                Ok(text) => text,
                Err(e) => {
                    error!(symbol = %rules.symbol, error = %e, "ai call failed");
                    fallback_explanation(rules, aggregation, market)
                }
            },
        }
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(AI_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn complete(
        &self,
        rules: &RulesOutput,
        aggregation: &AggregationResult,
        market: &BTreeMap<Timeframe, MarketSummary>,
    ) -> Result<String> {
        let prompt = build_prompt(rules, aggregation, market);

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.3,
                "max_tokens": 500,
            }))
            .send()
            .await
            .context("chat completions request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chat completions returned {status}");
        }

        let body: serde_json::Value = resp.json().await.context("chat completions body is not JSON")?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .context("chat completions body missing content")?;

        Ok(text.trim().to_string())
    }
}

/// Prompt sent to the model: a six-line Turkish analyst template over the
/// rules verdict, the per-timeframe signals and the market summaries.
fn build_prompt(
    rules: &RulesOutput,
    aggregation: &AggregationResult,
    market: &BTreeMap<Timeframe, MarketSummary>,
) -> String {
    let mut tf_lines = Vec::new();
    for tf in [Timeframe::H4, Timeframe::H1, Timeframe::M15] {
        let (Some(ms), Some(ts)) = (market.get(&tf), aggregation.timeframes.get(&tf)) else {
            continue;
        };
        let inds = ts
            .indicators
            .iter()
            .map(|i| format!("{}={}", i.indicator, i.signal))
            .collect::<Vec<_>>()
            .join(", ");
        let inds = if inds.is_empty() { "yok".to_string() } else { inds };
        tf_lines.push(format!(
            "  {tf}: price={}, slope={:+.2}, green/red={}/{}, sinyaller=[{inds}]",
            ms.last_price, ms.slope, ms.green_candles, ms.red_candles
        ));
    }

    format!(
        "Sen bir kripto piyasa analisti asistansın. Kesin al/sat emri VERMEDEN aşağıdaki verilere göre\n\
         6 satırlık Türkçe özet üret. Şablon:\n\n\
         1) Genel Durum: {{decision}} ({{confidence}}/100)\n\
         2) Trend: 4H ... | 1H ...\n\
         3) Sinyal Özeti: hangi indikatör hangi tf'de ne dedi (kısa)\n\
         4) Senaryo A: yükseliş olursa ...\n\
         5) Senaryo B: düşüş olursa ...\n\
         6) Risk: volatilite/stop şart, \"kesin al/sat\" yok\n\n\
         Veriler:\n\
         - Symbol: {symbol}\n\
         - Karar: {decision} | Eğilim: {bias} | Güven: {confidence}/100 | Skor: {score}\n\
         - Eşik: {threshold} | Veto: {veto} ({veto_reason})\n\
         - Nedenler: {reasons}\n\
         - Piyasa:\n{tf_lines}\n\n\
         6 satırlık özeti Türkçe yaz. \"Kesin al/sat\" ifadesi kullanma.",
        symbol = rules.symbol,
        decision = rules.decision,
        bias = rules.bias,
        confidence = rules.confidence,
        score = rules.score,
        threshold = rules.threshold,
        veto = rules.veto_applied,
        veto_reason = rules.veto_reason.as_deref().unwrap_or("yok"),
        reasons = if rules.reasons.is_empty() {
            "yok".to_string()
        } else {
            rules.reasons.join("; ")
        },
        tf_lines = tf_lines.join("\n"),
    )
}

/// Deterministic template used when no AI provider is reachable. Six lines,
/// no definitive trade advice.
pub fn fallback_explanation(
    rules: &RulesOutput,
    aggregation: &AggregationResult,
    market: &BTreeMap<Timeframe, MarketSummary>,
) -> String {
    let m4h = market.get(&Timeframe::H4);
    let m1h = market.get(&Timeframe::H1);

    let trend_of = |ms: Option<&MarketSummary>| {
        if ms.map_or(false, |m| m.slope > 0.0) {
            "yukari"
        } else {
            "asagi"
        }
    };

    let mut tf_signals = Vec::new();
    for (tf, ts) in &aggregation.timeframes {
        for ind in &ts.indicators {
            tf_signals.push(format!("{}@{}={}", ind.indicator, tf, ind.signal));
        }
    }
    let signal_text = if tf_signals.is_empty() {
        "sinyal yok".to_string()
    } else {
        tf_signals.join(", ")
    };

    let veto_text = if rules.veto_applied {
        format!(" (Veto: {})", rules.veto_reason.as_deref().unwrap_or(""))
    } else {
        String::new()
    };

    format!(
        "1) Genel Durum: {decision} ({confidence}/100){veto_text}\n\
         2) Trend: 4H {t4} (slope={s4:+.2}) | 1H {t1} (slope={s1:+.2})\n\
         3) Sinyal Ozeti: {signal_text}\n\
         4) Senaryo A: Yukselis devam ederse mevcut bias ({bias}) yonunde hareket.\n\
         5) Senaryo B: Dusus olursa bias degisebilir, stop/hedge degerlendir.\n\
         6) Risk: Skor={score:.3}, esik={threshold}. Kesin al/sat degil, kendi analizinle dogrula.",
        decision = rules.decision,
        confidence = rules.confidence,
        t4 = trend_of(m4h),
        s4 = m4h.map_or(0.0, |m| m.slope),
        t1 = trend_of(m1h),
        s1 = m1h.map_or(0.0, |m| m.slope),
        bias = rules.bias,
        score = rules.score,
        threshold = rules.threshold,
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{Bias, Decision};

    fn rules() -> RulesOutput {
        RulesOutput {
            symbol: "ETHUSDT".to_string(),
            decision: Decision::LongSetup,
            bias: Bias::Long,
            confidence: 72,
            score: 0.3612,
            threshold: 0.25,
            reasons: vec!["BigBeluga@4h: BUY (str=0.9, contrib=+0.405)".to_string()],
            veto_applied: false,
            veto_reason: None,
        }
    }

    fn aggregation() -> AggregationResult {
        AggregationResult {
            symbol: "ETHUSDT".to_string(),
            timeframes: BTreeMap::new(),
            used_events: vec![],
            aggregated_at: 1_700_000_000,
        }
    }

    fn market() -> BTreeMap<Timeframe, MarketSummary> {
        BTreeMap::from([
            (
                Timeframe::H4,
                MarketSummary {
                    tf: Timeframe::H4,
                    last_price: 3500.0,
                    green_candles: 14,
                    red_candles: 6,
                    slope: 20.0,
                },
            ),
            (
                Timeframe::H1,
                MarketSummary {
                    tf: Timeframe::H1,
                    last_price: 3500.0,
                    green_candles: 10,
                    red_candles: 10,
                    slope: -5.0,
                },
            ),
        ])
    }

    #[test]
    fn fallback_has_six_lines() {
        let text = fallback_explanation(&rules(), &aggregation(), &market());
        assert_eq!(text.lines().count(), 6);
        assert!(text.contains("LONG_SETUP (72/100)"));
        assert!(text.contains("4H yukari"));
        assert!(text.contains("1H asagi"));
        assert!(text.contains("sinyal yok"));
    }

    #[test]
    fn fallback_mentions_veto() {
        let mut r = rules();
        r.veto_applied = true;
        r.veto_reason = Some("4H net SELL — LONG_SETUP vetoed".to_string());
        let text = fallback_explanation(&r, &aggregation(), &market());
        assert!(text.contains("Veto: 4H net SELL"));
    }

    #[test]
    fn fallback_survives_missing_market() {
        let text = fallback_explanation(&rules(), &aggregation(), &BTreeMap::new());
        assert_eq!(text.lines().count(), 6);
        assert!(text.contains("slope=+0.00"));
    }

    #[test]
    fn prompt_carries_verdict_and_market_lines() {
        let prompt = build_prompt(&rules(), &aggregation(), &market());
        assert!(prompt.contains("Symbol: ETHUSDT"));
        assert!(prompt.contains("Karar: LONG_SETUP"));
        // Aggregation has no 4h summary, so no market line is rendered for it.
        assert!(!prompt.contains("  4h: price"));
    }

    #[tokio::test]
    async fn dummy_provider_uses_fallback() {
        let client = AiClient::from_settings(&Settings::test_defaults());
        assert!(matches!(client, AiClient::Dummy));
        let text = client.explain(&rules(), &aggregation(), &market()).await;
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn openai_selected_only_with_key() {
        let mut settings = Settings::test_defaults();
        settings.ai_provider = "openai".to_string();
        assert!(matches!(AiClient::from_settings(&settings), AiClient::Dummy));

        settings.ai_api_key = "sk-test".to_string();
        assert!(matches!(
            AiClient::from_settings(&settings),
            AiClient::OpenAi(_)
        ));
    }
}
