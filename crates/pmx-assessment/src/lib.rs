//! Assessment engine: per-instrument score, expected return, confidence and
//! signal label. Two backends share one contract; Basic works from trailing
//! price statistics blended with stability, Context works from the joint
//! context embedding.

use std::fmt;

use chrono::NaiveDate;
use serde_json::json;

use pmx_config::AssessmentConfig;
use pmx_schemas::{InstrumentScoreRow, PriceBar, SignalLabel, SoftTargetClass};

mod runner;
pub use runner::{run_assessment, AssessmentRequest};

pub const MODEL_BASIC: &str = "assessment-basic-v1";
pub const MODEL_CONTEXT: &str = "assessment-context-v1";

/// Coverage below this fraction of the horizon yields SKIP.
pub const MIN_COVERAGE: f64 = 0.5;

const EPS: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub enum AssessmentError {
    /// Context embedding absent with `strict = true`.
    MissingContext { as_of_date: NaiveDate },
    /// A computed value came out non-finite.
    NonFinite { instrument_id: String },
}

impl fmt::Display for AssessmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssessmentError::MissingContext { as_of_date } => {
                write!(f, "context embedding missing for {as_of_date} (strict)")
            }
            AssessmentError::NonFinite { instrument_id } => {
                write!(f, "non-finite assessment output for {instrument_id}")
            }
        }
    }
}

impl std::error::Error for AssessmentError {}

/// Stability inputs for one instrument (absent = treated as Stable).
#[derive(Clone, Copy, Debug, Default)]
pub struct FragilityInput {
    pub class: Option<SoftTargetClass>,
    pub risk_score: f64,
}

impl FragilityInput {
    /// Score downweight by fragility class: Fragile ×0.7, Targetable ×0.3,
    /// Breaker ×0.
    pub fn score_multiplier(&self) -> f64 {
        match self.class {
            Some(SoftTargetClass::Fragile) => 0.7,
            Some(SoftTargetClass::Targetable) => 0.3,
            Some(SoftTargetClass::Breaker) => 0.0,
            _ => 1.0,
        }
    }

    /// Penalty term fed into the expected-return expression.
    pub fn penalty(&self) -> f64 {
        1.0 - self.score_multiplier()
    }
}

// ---------------------------------------------------------------------------
// Basic backend
// ---------------------------------------------------------------------------

/// Score one instrument from trailing price statistics.
///
/// - μ, σ: realized return and volatility over the last `horizon_days` bars.
/// - `expected_return = μ − λ·σ − β·fragility_penalty`
/// - `score = tanh(expected_return / σ) × fragility_multiplier`
/// - `confidence = clip(coverage · (1 − fragility_risk_score), 0, 1)`
/// - label: BUY above `τ_buy`, SELL below `−τ_sell`, else HOLD;
///   SKIP when coverage < 0.5.
pub fn assess_basic(
    strategy_id: &str,
    market_id: &str,
    instrument_id: &str,
    bars: &[PriceBar],
    as_of_date: NaiveDate,
    fragility: FragilityInput,
    cfg: &AssessmentConfig,
) -> Result<InstrumentScoreRow, AssessmentError> {
    let mut closes: Vec<(NaiveDate, f64)> = bars
        .iter()
        .filter(|b| b.instrument_id == instrument_id && b.date <= as_of_date && b.is_valid())
        .map(|b| (b.date, b.adj_close))
        .collect();
    closes.sort_by_key(|(d, _)| *d);

    let horizon = cfg.horizon_days as usize;
    let need = horizon + 1;
    let tail: Vec<f64> = closes
        .iter()
        .rev()
        .take(need)
        .rev()
        .map(|(_, c)| *c)
        .collect();

    let coverage = ((tail.len().saturating_sub(1)) as f64 / horizon.max(1) as f64).min(1.0);

    if tail.len() < 2 || coverage < MIN_COVERAGE {
        return Ok(score_row(
            strategy_id,
            market_id,
            instrument_id,
            as_of_date,
            cfg,
            MODEL_BASIC,
            0.0,
            0.0,
            0.0,
            SignalLabel::Skip,
            json!({ "coverage": coverage, "reason": "insufficient coverage" }),
        ));
    }

    let mut rets = Vec::with_capacity(tail.len() - 1);
    for w in tail.windows(2) {
        rets.push(w[1] / w[0] - 1.0);
    }
    let n = rets.len() as f64;
    let mu = rets.iter().sum::<f64>() / n;
    let var = rets.iter().map(|r| (r - mu) * (r - mu)).sum::<f64>() / n;
    let sigma = var.sqrt().max(EPS);

    let expected_return = mu - cfg.vol_penalty * sigma - cfg.fragility_penalty * fragility.penalty();
    let score = (expected_return / sigma).tanh() * fragility.score_multiplier();
    let confidence = (coverage * (1.0 - fragility.risk_score)).clamp(0.0, 1.0);

    if !score.is_finite() || !expected_return.is_finite() {
        return Err(AssessmentError::NonFinite {
            instrument_id: instrument_id.to_string(),
        });
    }

    let label = label_for(score, cfg);
    Ok(score_row(
        strategy_id,
        market_id,
        instrument_id,
        as_of_date,
        cfg,
        MODEL_BASIC,
        score,
        expected_return,
        confidence,
        label,
        json!({
            "coverage": coverage,
            "mu": mu,
            "sigma": sigma,
            "fragility_multiplier": fragility.score_multiplier(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Context backend
// ---------------------------------------------------------------------------

/// Affine map applied to the context-embedding statistics. Persisted in the
/// score metadata so a reader can reproduce the output from the vector.
#[derive(Clone, Copy, Debug)]
pub struct ContextAffineMap {
    pub score_proj: f64,
    pub score_norm: f64,
    pub er_scale: f64,
    pub confidence: f64,
}

impl Default for ContextAffineMap {
    fn default() -> Self {
        Self {
            score_proj: 2.0,
            score_norm: 0.5,
            er_scale: 0.02,
            confidence: 0.5,
        }
    }
}

/// Score one instrument from the shared context embedding: derive the L2
/// norm and the projection onto a fixed reference direction, then apply the
/// affine map.
pub fn assess_context(
    strategy_id: &str,
    market_id: &str,
    instrument_id: &str,
    ctx_vector: &[f32],
    reference: &[f32],
    as_of_date: NaiveDate,
    fragility: FragilityInput,
    map: ContextAffineMap,
    cfg: &AssessmentConfig,
) -> Result<InstrumentScoreRow, AssessmentError> {
    let norm: f64 = ctx_vector.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let proj: f64 = ctx_vector
        .iter()
        .zip(reference.iter())
        .map(|(a, b)| (*a as f64) * (*b as f64))
        .sum();

    let score =
        ((map.score_proj * proj + map.score_norm * (norm - 1.0)).tanh()) * fragility.score_multiplier();
    let expected_return = map.er_scale * score;
    let confidence = (map.confidence * (1.0 - fragility.risk_score)).clamp(0.0, 1.0);

    if !score.is_finite() {
        return Err(AssessmentError::NonFinite {
            instrument_id: instrument_id.to_string(),
        });
    }

    let label = label_for(score, cfg);
    Ok(score_row(
        strategy_id,
        market_id,
        instrument_id,
        as_of_date,
        cfg,
        MODEL_CONTEXT,
        score,
        expected_return,
        confidence,
        label,
        json!({
            "l2_norm": norm,
            "projection": proj,
            "affine": {
                "score_proj": map.score_proj,
                "score_norm": map.score_norm,
                "er_scale": map.er_scale,
                "confidence": map.confidence,
            },
        }),
    ))
}

fn label_for(score: f64, cfg: &AssessmentConfig) -> SignalLabel {
    if score > cfg.tau_buy {
        SignalLabel::Buy
    } else if score < -cfg.tau_sell {
        SignalLabel::Sell
    } else {
        SignalLabel::Hold
    }
}

#[allow(clippy::too_many_arguments)]
fn score_row(
    strategy_id: &str,
    market_id: &str,
    instrument_id: &str,
    as_of_date: NaiveDate,
    cfg: &AssessmentConfig,
    model_id: &str,
    score: f64,
    expected_return: f64,
    confidence: f64,
    signal_label: SignalLabel,
    metadata: serde_json::Value,
) -> InstrumentScoreRow {
    InstrumentScoreRow {
        strategy_id: strategy_id.to_string(),
        market_id: market_id.to_string(),
        instrument_id: instrument_id.to_string(),
        as_of_date,
        horizon_days: cfg.horizon_days as i32,
        model_id: model_id.to_string(),
        score,
        expected_return,
        confidence,
        signal_label,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        let start: NaiveDate = "2025-01-01".parse().unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceBar {
                instrument_id: "A".into(),
                date: start + chrono::Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                adj_close: *c,
                volume: 1_000,
            })
            .collect()
    }

    fn cfg(horizon: u32) -> AssessmentConfig {
        AssessmentConfig {
            horizon_days: horizon,
            ..AssessmentConfig::default()
        }
    }

    fn as_of() -> NaiveDate {
        "2025-03-01".parse().unwrap()
    }

    #[test]
    fn uptrend_scores_positive_and_buy() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let row = assess_basic(
            "S1",
            "XNYS",
            "A",
            &bars(&closes),
            as_of(),
            FragilityInput::default(),
            &cfg(21),
        )
        .unwrap();
        assert!(row.score > 0.0);
        assert_eq!(row.signal_label, SignalLabel::Buy);
        assert_eq!(row.model_id, MODEL_BASIC);
    }

    #[test]
    fn downtrend_scores_negative() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 * 0.99f64.powi(i)).collect();
        let row = assess_basic(
            "S1",
            "XNYS",
            "A",
            &bars(&closes),
            as_of(),
            FragilityInput::default(),
            &cfg(21),
        )
        .unwrap();
        assert!(row.score < 0.0);
        assert_eq!(row.signal_label, SignalLabel::Sell);
    }

    #[test]
    fn low_coverage_skips() {
        // 5 bars against a 21-day horizon: coverage < 0.5.
        let row = assess_basic(
            "S1",
            "XNYS",
            "A",
            &bars(&[100.0, 101.0, 102.0, 103.0, 104.0]),
            as_of(),
            FragilityInput::default(),
            &cfg(21),
        )
        .unwrap();
        assert_eq!(row.signal_label, SignalLabel::Skip);
        assert_eq!(row.confidence, 0.0);
    }

    #[test]
    fn breaker_zeroes_the_score() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let row = assess_basic(
            "S1",
            "XNYS",
            "A",
            &bars(&closes),
            as_of(),
            FragilityInput {
                class: Some(SoftTargetClass::Breaker),
                risk_score: 0.9,
            },
            &cfg(21),
        )
        .unwrap();
        assert_eq!(row.score, 0.0);
        assert_eq!(row.signal_label, SignalLabel::Hold);
    }

    #[test]
    fn fragility_downweights_monotonically() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let score_for = |class: Option<SoftTargetClass>| {
            assess_basic(
                "S1",
                "XNYS",
                "A",
                &bars(&closes),
                as_of(),
                FragilityInput { class, risk_score: 0.0 },
                &cfg(21),
            )
            .unwrap()
            .score
        };
        let stable = score_for(None);
        let fragile = score_for(Some(SoftTargetClass::Fragile));
        let targetable = score_for(Some(SoftTargetClass::Targetable));
        assert!(stable > 0.0);
        assert!(stable > fragile && fragile > targetable);
        // The multiplier also bounds the magnitude a fragile name can reach.
        assert!(targetable.abs() <= 0.3 + 1e-12);
    }

    #[test]
    fn risk_score_reduces_confidence() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 * 1.005f64.powi(i)).collect();
        let calm = assess_basic(
            "S1", "XNYS", "A", &bars(&closes), as_of(),
            FragilityInput { class: None, risk_score: 0.0 }, &cfg(21),
        ).unwrap();
        let risky = assess_basic(
            "S1", "XNYS", "A", &bars(&closes), as_of(),
            FragilityInput { class: None, risk_score: 0.8 }, &cfg(21),
        ).unwrap();
        assert!(risky.confidence < calm.confidence);
    }

    #[test]
    fn context_backend_uses_projection() {
        let reference = vec![1.0f32, 0.0, 0.0];
        let aligned = vec![0.8f32, 0.0, 0.0];
        let opposed = vec![-0.8f32, 0.0, 0.0];

        let up = assess_context(
            "S1", "XNYS", "A", &aligned, &reference, as_of(),
            FragilityInput::default(), ContextAffineMap::default(), &cfg(21),
        ).unwrap();
        let down = assess_context(
            "S1", "XNYS", "A", &opposed, &reference, as_of(),
            FragilityInput::default(), ContextAffineMap::default(), &cfg(21),
        ).unwrap();

        assert!(up.score > 0.0);
        assert!(down.score < 0.0);
        assert_eq!(up.model_id, MODEL_CONTEXT);
        assert_eq!(up.metadata["affine"]["er_scale"], 0.02);
    }
}
