//! Deterministic window→vector encoders and their persistent cache.
//!
//! An encoder is a pure function `encode(model, entity, as_of, features) →
//! vector ∈ R^dim` with a contractually fixed output dimension per model id.
//! Any pseudo-randomness inside an encoder is seeded from the full
//! `(model_id, entity_id, as_of_date)` key. Encoders pad and truncate
//! deterministically so the contract is size-stable across history. Any
//! encoder producing NaN or wrong-dim vectors errors; callers never write
//! such rows.

use std::fmt;

use chrono::NaiveDate;

pub mod joint;
pub mod store;
pub mod window;

pub use joint::combine_joint;
pub use store::EncoderStore;
pub use window::PriceWindow;

/// Output dimension shared by every v1 model id.
pub const DIM_V1: usize = 384;

/// Known model ids. The registry is closed: an unknown id is an error, not a
/// default dim.
pub const NUM_REGIME_CORE_V1: &str = "num-regime-core-v1";
pub const NUM_STAB_CORE_V1: &str = "num-stab-core-v1";
pub const NUM_PROFILE_CORE_V1: &str = "num-profile-core-v1";
pub const NUM_SCENARIO_CORE_V1: &str = "num-scenario-core-v1";
pub const NUM_PORTFOLIO_CORE_V1: &str = "num-portfolio-core-v1";
pub const ASSESSMENT_CTX_V0: &str = "ASSESSMENT_CTX_V0";

/// Declared output dim for a model id, or None for unknown ids.
pub fn declared_dim(model_id: &str) -> Option<usize> {
    let known = model_id == NUM_REGIME_CORE_V1
        || model_id == NUM_STAB_CORE_V1
        || model_id == NUM_PROFILE_CORE_V1
        || model_id == NUM_SCENARIO_CORE_V1
        || model_id == NUM_PORTFOLIO_CORE_V1
        || model_id == ASSESSMENT_CTX_V0
        || model_id.starts_with("text-") && model_id.ends_with("-v1")
        || model_id.starts_with("joint-") && model_id.ends_with("-v1");
    known.then_some(DIM_V1)
}

#[derive(Clone, Debug, PartialEq)]
pub enum EncoderError {
    UnknownModel { model_id: String },
    /// A feature or output component was NaN/inf.
    NonFinite { model_id: String, index: usize },
    /// Produced or consumed vector length does not match the declared dim.
    DimMismatch { model_id: String, expected: usize, actual: usize },
    /// The window has no usable bars.
    EmptyWindow,
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderError::UnknownModel { model_id } => {
                write!(f, "unknown encoder model: {model_id}")
            }
            EncoderError::NonFinite { model_id, index } => {
                write!(f, "non-finite value at {index} in {model_id}")
            }
            EncoderError::DimMismatch { model_id, expected, actual } => {
                write!(f, "dim mismatch for {model_id}: expected {expected}, got {actual}")
            }
            EncoderError::EmptyWindow => write!(f, "empty feature window"),
        }
    }
}

impl std::error::Error for EncoderError {}

/// Encode a feature slice into the model's fixed-dim vector.
///
/// The expansion is a pseudo-random projection whose seed folds the full
/// `(model_id, entity_id, as_of_date)` key, so any randomness inside the
/// encoder is pinned to the row it produces: the same key and features map to
/// identical vectors on every machine, and concurrent encoders racing on one
/// cache key cannot disagree. Features are cycled (pad) or folded (truncate)
/// across the output without data-dependent branching.
pub fn encode(
    model_id: &str,
    entity_id: &str,
    as_of_date: NaiveDate,
    features: &[f64],
) -> Result<Vec<f32>, EncoderError> {
    let dim = declared_dim(model_id).ok_or_else(|| EncoderError::UnknownModel {
        model_id: model_id.to_string(),
    })?;
    if features.is_empty() {
        return Err(EncoderError::EmptyWindow);
    }
    for (i, x) in features.iter().enumerate() {
        if !x.is_finite() {
            return Err(EncoderError::NonFinite {
                model_id: model_id.to_string(),
                index: i,
            });
        }
    }

    let mut rng = Xorshift64Star::from_label(&format!("{model_id}|{entity_id}|{as_of_date}"));
    let mut out = vec![0f32; dim];
    for slot in out.iter_mut() {
        // Sparse signed combination of three feature taps per output slot.
        let mut acc = 0.0f64;
        for _ in 0..3 {
            let idx = (rng.next() as usize) % features.len();
            let sign = if rng.next() & 1 == 0 { 1.0 } else { -1.0 };
            acc += sign * features[idx];
        }
        *slot = acc.tanh() as f32;
    }

    l2_normalize(&mut out);

    for (i, x) in out.iter().enumerate() {
        if !x.is_finite() {
            return Err(EncoderError::NonFinite {
                model_id: model_id.to_string(),
                index: i,
            });
        }
    }
    Ok(out)
}

/// Validate a vector against a model's declared dim and finiteness.
pub fn validate_vector(model_id: &str, v: &[f32]) -> Result<(), EncoderError> {
    let dim = declared_dim(model_id).ok_or_else(|| EncoderError::UnknownModel {
        model_id: model_id.to_string(),
    })?;
    if v.len() != dim {
        return Err(EncoderError::DimMismatch {
            model_id: model_id.to_string(),
            expected: dim,
            actual: v.len(),
        });
    }
    for (i, x) in v.iter().enumerate() {
        if !x.is_finite() {
            return Err(EncoderError::NonFinite {
                model_id: model_id.to_string(),
                index: i,
            });
        }
    }
    Ok(())
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = ((*x as f64) / norm) as f32;
        }
    }
}

/// xorshift64* seeded from a label hash. Deterministic across platforms;
/// no external RNG dependency so the projection can never drift with a crate
/// upgrade.
struct Xorshift64Star {
    state: u64,
}

impl Xorshift64Star {
    fn from_label(label: &str) -> Self {
        // FNV-1a over the label; zero state is illegal for xorshift.
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut h = FNV_OFFSET;
        for b in label.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        Self {
            state: if h == 0 { FNV_OFFSET } else { h },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        "2025-03-10".parse().unwrap()
    }

    #[test]
    fn encode_is_deterministic_and_fixed_dim() {
        let features = vec![0.01, -0.02, 0.15, 0.003];
        let a = encode(NUM_REGIME_CORE_V1, "SPY.US", day(), &features).unwrap();
        let b = encode(NUM_REGIME_CORE_V1, "SPY.US", day(), &features).unwrap();
        assert_eq!(a.len(), DIM_V1);
        assert_eq!(a, b);
    }

    #[test]
    fn different_models_project_differently() {
        let features = vec![0.01, -0.02, 0.15, 0.003];
        let a = encode(NUM_REGIME_CORE_V1, "SPY.US", day(), &features).unwrap();
        let b = encode(NUM_STAB_CORE_V1, "SPY.US", day(), &features).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn seed_covers_entity_and_date() {
        // The projection seed is the full (model, entity, as_of) key: the
        // same features under a different entity or date give a different
        // vector.
        let features = vec![0.01, -0.02, 0.15, 0.003];
        let base = encode(NUM_REGIME_CORE_V1, "SPY.US", day(), &features).unwrap();
        let other_entity = encode(NUM_REGIME_CORE_V1, "QQQ.US", day(), &features).unwrap();
        let other_day = encode(
            NUM_REGIME_CORE_V1,
            "SPY.US",
            "2025-03-11".parse().unwrap(),
            &features,
        )
        .unwrap();
        assert_ne!(base, other_entity);
        assert_ne!(base, other_day);
    }

    #[test]
    fn encode_rejects_nan_features() {
        let err = encode(NUM_REGIME_CORE_V1, "SPY.US", day(), &[0.1, f64::NAN]).unwrap_err();
        assert!(matches!(err, EncoderError::NonFinite { index: 1, .. }));
    }

    #[test]
    fn encode_rejects_unknown_model() {
        let err = encode("num-regime-core-v9", "SPY.US", day(), &[0.1]).unwrap_err();
        assert!(matches!(err, EncoderError::UnknownModel { .. }));
    }

    #[test]
    fn output_is_unit_norm() {
        let v = encode(NUM_PROFILE_CORE_V1, "SPY.US", day(), &[0.4, 0.1, -0.2]).unwrap();
        let norm: f64 = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn validate_vector_checks_dim() {
        let err = validate_vector(NUM_REGIME_CORE_V1, &[0.0; 100]).unwrap_err();
        assert!(matches!(
            err,
            EncoderError::DimMismatch { expected: 384, actual: 100, .. }
        ));
    }

    #[test]
    fn text_and_joint_v1_ids_are_registered() {
        assert_eq!(declared_dim("text-news-v1"), Some(DIM_V1));
        assert_eq!(declared_dim("joint-assessment-v1"), Some(DIM_V1));
        assert_eq!(declared_dim("text-news-v2"), None);
    }
}
