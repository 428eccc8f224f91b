// =============================================================================
// Rules Engine -- deterministic scoring, bias, veto, decision, confidence
// =============================================================================
//
// Pure function over an aggregation and the runtime config:
//
//   score = sum over tf, indicator of
//           direction * tf_weight * indicator_weight * strength
//
// An unlisted timeframe weighs 0.0 (the set is closed); an unlisted
// indicator weighs 1.0 (the set is open). The 4h summary can veto a
// same-direction decision when its own evidence points the other way.
// =============================================================================

use crate::evaluation::{AggregationResult, Bias, Decision, RulesOutput, TimeframeSummary};
use crate::runtime_config::RuntimeConfig;
use crate::types::Timeframe;

/// Default weight applied to the 4h veto score when 4h is missing from
/// `tf_weights`.
const VETO_H4_WEIGHT_DEFAULT: f64 = 0.5;

/// Run the deterministic rules on aggregated data.
pub fn evaluate(aggregation: &AggregationResult, config: &RuntimeConfig) -> RulesOutput {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    for (tf, summary) in &aggregation.timeframes {
        let tf_weight = config.tf_weights.get(tf).copied().unwrap_or(0.0);

        for ind_sig in &summary.indicators {
            let ind_weight = config
                .indicator_weights
                .get(&ind_sig.indicator)
                .copied()
                .unwrap_or(1.0);
            let direction = ind_sig.signal.direction();
            let contribution = direction * tf_weight * ind_weight * ind_sig.strength;
            score += contribution;

            if direction != 0.0 {
                reasons.push(format!(
                    "{}@{}: {} (str={:.1}, contrib={:+.3})",
                    ind_sig.indicator, tf, ind_sig.signal, ind_sig.strength, contribution
                ));
            }
        }
    }

    let threshold = config.threshold;

    let bias = if score >= threshold {
        Bias::Long
    } else if score <= -threshold {
        Bias::Short
    } else {
        Bias::Neutral
    };

    // Veto: 4h evidence against the biased direction suppresses the setup.
    let mut veto_applied = false;
    let mut veto_reason = None;

    if let Some(tf_4h) = aggregation.timeframes.get(&Timeframe::H4) {
        let h4_score = h4_directional_score(tf_4h, config);

        let h4_net_sell = tf_4h.sell_count > tf_4h.buy_count || h4_score < 0.0;
        let h4_net_buy = tf_4h.buy_count > tf_4h.sell_count || h4_score > 0.0;

        if bias == Bias::Long && h4_net_sell {
            veto_applied = true;
            veto_reason = Some("4H net SELL — LONG_SETUP vetoed".to_string());
        } else if bias == Bias::Short && h4_net_buy {
            veto_applied = true;
            veto_reason = Some("4H net BUY — SHORT_SETUP vetoed".to_string());
        }
    }

    let decision = if veto_applied {
        Decision::NoTrade
    } else {
        match bias {
            Bias::Long => Decision::LongSetup,
            Bias::Short => Decision::ShortSetup,
            Bias::Neutral => Decision::Watch,
        }
    };

    // confidence = min(100, floor(100 * |score| / (2 * threshold)))
    let confidence = ((score.abs() / (threshold * 2.0)) * 100.0) as i64;
    let confidence = confidence.min(100).max(0) as u32;

    RulesOutput {
        symbol: aggregation.symbol.clone(),
        decision,
        bias,
        confidence,
        score: (score * 10_000.0).round() / 10_000.0,
        threshold,
        reasons,
        veto_applied,
        veto_reason,
    }
}

/// Directional score computed from 4h contributions only.
fn h4_directional_score(summary: &TimeframeSummary, config: &RuntimeConfig) -> f64 {
    let h4_weight = config
        .tf_weights
        .get(&Timeframe::H4)
        .copied()
        .unwrap_or(VETO_H4_WEIGHT_DEFAULT);

    summary
        .indicators
        .iter()
        .map(|ind_sig| {
            let ind_weight = config
                .indicator_weights
                .get(&ind_sig.indicator)
                .copied()
                .unwrap_or(1.0);
            ind_sig.signal.direction() * h4_weight * ind_weight * ind_sig.strength
        })
        .sum()
}

// =============================================================================
// Tests
// =============================================================================
