//! Regime engine: classify `(region, as_of_date)` into a regime label with
//! confidence, embedding, and a hysteresis-gated transition log.
//!
//! The classifier is pure; `run_regime` is the persistence rim.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde_json::json;

use pmx_encoders::{encode, EncoderError, NUM_REGIME_CORE_V1};
use pmx_schemas::{RegimeLabel, RegimeStateRow};

mod runner;
pub use runner::run_regime;

/// Labels eligible as classification outputs (everything except UNKNOWN).
const CLASSIFIABLE: &[RegimeLabel] = &[
    RegimeLabel::Carry,
    RegimeLabel::Crisis,
    RegimeLabel::Neutral,
    RegimeLabel::PolicyRecovery,
    RegimeLabel::Recovery,
    RegimeLabel::RiskOffGrinding,
    RegimeLabel::RiskOffPanic,
    RegimeLabel::RiskOnHighVol,
    RegimeLabel::RiskOnLowVol,
    RegimeLabel::Transition,
];

#[derive(Clone, Debug, PartialEq)]
pub enum RegimeError {
    /// Prototype vector dim does not match the query vector.
    DimMismatch { label: RegimeLabel, expected: usize, actual: usize },
    /// Temperature must be strictly positive.
    BadTemperature { temperature: f64 },
    Encoder(EncoderError),
    /// The prototype set is empty.
    NoPrototypes,
}

impl fmt::Display for RegimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegimeError::DimMismatch { label, expected, actual } => write!(
                f,
                "prototype dim mismatch for {label}: expected {expected}, got {actual}"
            ),
            RegimeError::BadTemperature { temperature } => {
                write!(f, "temperature must be > 0, got {temperature}")
            }
            RegimeError::Encoder(e) => write!(f, "encoder: {e}"),
            RegimeError::NoPrototypes => write!(f, "prototype set is empty"),
        }
    }
}

impl std::error::Error for RegimeError {}

impl From<EncoderError> for RegimeError {
    fn from(e: EncoderError) -> Self {
        RegimeError::Encoder(e)
    }
}

// ---------------------------------------------------------------------------
// Prototypes
// ---------------------------------------------------------------------------

/// `label → centroid` map. Iteration order is the lexical label order, which
/// is also the classifier's tie-break order.
#[derive(Clone, Debug)]
pub struct PrototypeSet {
    centroids: BTreeMap<RegimeLabel, Vec<f32>>,
}

impl PrototypeSet {
    pub fn new(centroids: BTreeMap<RegimeLabel, Vec<f32>>) -> Self {
        Self { centroids }
    }

    /// Built-in v1 prototypes: one deterministic centroid per classifiable
    /// label, derived with the regime encoder from a label-specific feature
    /// pattern. The encoder seed key is the label itself at a fixed anchor
    /// date, so centroids are constants. Calibration is configuration, not
    /// code — a prototypes file overrides these.
    pub fn builtin_v1() -> Self {
        let anchor = prototype_anchor_date();
        let mut centroids = BTreeMap::new();
        for (i, label) in CLASSIFIABLE.iter().enumerate() {
            // Distinct deterministic pattern per label index.
            let phase = (i as f64 + 1.0) * 0.37;
            let feats: Vec<f64> = (0..16)
                .map(|k| ((k as f64) * phase).sin() * 0.05)
                .collect();
            let v = encode(NUM_REGIME_CORE_V1, label.as_str(), anchor, &feats)
                .expect("builtin prototype features are finite");
            centroids.insert(*label, v);
        }
        Self { centroids }
    }

    /// Parse `{ "LABEL": [f32...] }` from config JSON.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut centroids = BTreeMap::new();
        for (k, v) in obj {
            let label = RegimeLabel::parse(k).ok()?;
            let vec: Vec<f32> = v
                .as_array()?
                .iter()
                .map(|x| x.as_f64().map(|f| f as f32))
                .collect::<Option<_>>()?;
            centroids.insert(label, vec);
        }
        Some(Self { centroids })
    }

    pub fn labels(&self) -> impl Iterator<Item = &RegimeLabel> {
        self.centroids.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

/// Fixed anchor date for synthetic encoder invocations (prototype
/// centroids). Part of the centroid definition: changing it is a new
/// prototype set.
pub fn prototype_anchor_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("anchor date is valid")
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Classification {
    pub label: RegimeLabel,
    pub confidence: f64,
    /// Softmin probabilities per label, summing to 1.
    pub probabilities: BTreeMap<RegimeLabel, f64>,
}

/// Softmin over prototype distances:
/// `p_k = exp(−d_k/τ) / Σ exp(−d_j/τ)`, `label = argmax p_k`.
///
/// Tie-break: lexical order on label (BTreeMap iteration + strict `>`).
pub fn classify(
    z: &[f32],
    prototypes: &PrototypeSet,
    temperature: f64,
) -> Result<Classification, RegimeError> {
    if prototypes.is_empty() {
        return Err(RegimeError::NoPrototypes);
    }
    if temperature <= 0.0 || !temperature.is_finite() {
        return Err(RegimeError::BadTemperature { temperature });
    }

    let mut distances: BTreeMap<RegimeLabel, f64> = BTreeMap::new();
    for (label, c) in &prototypes.centroids {
        if c.len() != z.len() {
            return Err(RegimeError::DimMismatch {
                label: *label,
                expected: z.len(),
                actual: c.len(),
            });
        }
        let d: f64 = z
            .iter()
            .zip(c.iter())
            .map(|(a, b)| {
                let diff = (*a - *b) as f64;
                diff * diff
            })
            .sum::<f64>()
            .sqrt();
        distances.insert(*label, d);
    }

    // Subtract the min distance before exponentiating for numeric stability;
    // softmin is invariant under a common shift.
    let d_min = distances.values().cloned().fold(f64::INFINITY, f64::min);
    let mut probabilities = BTreeMap::new();
    let mut z_sum = 0.0;
    for (label, d) in &distances {
        let e = (-(d - d_min) / temperature).exp();
        probabilities.insert(*label, e);
        z_sum += e;
    }
    for p in probabilities.values_mut() {
        *p /= z_sum;
    }

    let mut best = None;
    let mut best_p = f64::NEG_INFINITY;
    for (label, p) in &probabilities {
        if *p > best_p {
            best_p = *p;
            best = Some(*label);
        }
    }

    Ok(Classification {
        label: best.expect("non-empty prototype set"),
        confidence: best_p,
        probabilities,
    })
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

/// Outcome of the hysteresis gate for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct HysteresisDecision {
    /// Label to persist for this run.
    pub persist_label: RegimeLabel,
    /// Consecutive runs the raw candidate has held (carried in metadata).
    pub candidate_streak: u32,
    /// Transition to append, when the gate opens.
    pub transition: Option<(RegimeLabel, RegimeLabel)>,
}

/// Candidate streak carried on the previous row's metadata.
pub fn candidate_streak_of(prev: &RegimeStateRow) -> (Option<RegimeLabel>, u32) {
    let label = prev
        .metadata
        .get("candidate_label")
        .and_then(|v| v.as_str())
        .and_then(|s| RegimeLabel::parse(s).ok());
    let streak = prev
        .metadata
        .get("candidate_streak")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    (label, streak)
}

/// Apply the hysteresis gate.
///
/// The raw candidate must hold for `hysteresis_days` consecutive runs before
/// the transition row is written; until then the previous label is
/// re-persisted. Alternating candidates reset the streak, so flapping
/// produces zero transitions.
pub fn apply_hysteresis(
    prev: Option<&RegimeStateRow>,
    candidate: RegimeLabel,
    hysteresis_days: u32,
) -> HysteresisDecision {
    let Some(prev) = prev else {
        // First observation for the region: persist directly, no transition.
        return HysteresisDecision {
            persist_label: candidate,
            candidate_streak: 0,
            transition: None,
        };
    };

    if candidate == prev.regime_label {
        return HysteresisDecision {
            persist_label: candidate,
            candidate_streak: 0,
            transition: None,
        };
    }

    let (prev_candidate, prev_streak) = candidate_streak_of(prev);
    let streak = if prev_candidate == Some(candidate) {
        prev_streak + 1
    } else {
        1
    };

    if streak >= hysteresis_days.max(1) {
        HysteresisDecision {
            persist_label: candidate,
            candidate_streak: 0,
            transition: Some((prev.regime_label, candidate)),
        }
    } else {
        HysteresisDecision {
            persist_label: prev.regime_label,
            candidate_streak: streak,
            transition: None,
        }
    }
}

/// Build the metadata object persisted with a regime row.
pub fn state_metadata(
    candidate: RegimeLabel,
    decision: &HysteresisDecision,
    override_active: bool,
    reason: Option<&str>,
) -> serde_json::Value {
    let mut m = json!({
        "candidate_label": candidate.as_str(),
        "candidate_streak": decision.candidate_streak,
        "override": override_active,
    });
    if let Some(r) = reason {
        m["reason"] = json!(r);
    }
    m
}

/// Degraded output: UNKNOWN with confidence 0 and a reason. Never an error.
pub fn unknown_state(region: &str, as_of_date: NaiveDate, reason: &str) -> RegimeStateRow {
    RegimeStateRow {
        region: region.to_string(),
        as_of_date,
        regime_label: RegimeLabel::Unknown,
        confidence: 0.0,
        embedding: Vec::new(),
        metadata: json!({ "reason": reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto_pair() -> PrototypeSet {
        let mut m = BTreeMap::new();
        m.insert(RegimeLabel::Neutral, vec![0.0f32, 0.0]);
        m.insert(RegimeLabel::Crisis, vec![1.0f32, 1.0]);
        PrototypeSet::new(m)
    }

    fn row(label: RegimeLabel, meta: serde_json::Value) -> RegimeStateRow {
        RegimeStateRow {
            region: "US".into(),
            as_of_date: "2025-03-10".parse().unwrap(),
            regime_label: label,
            confidence: 0.8,
            embedding: vec![],
            metadata: meta,
        }
    }

    #[test]
    fn classify_picks_nearest_prototype() {
        let c = classify(&[0.1, 0.1], &proto_pair(), 1.0).unwrap();
        assert_eq!(c.label, RegimeLabel::Neutral);
        assert!(c.confidence > 0.5);

        let c = classify(&[0.9, 0.9], &proto_pair(), 1.0).unwrap();
        assert_eq!(c.label, RegimeLabel::Crisis);
    }

    #[test]
    fn probabilities_sum_to_one_and_confidence_in_range() {
        let c = classify(&[0.5, 0.4], &proto_pair(), 0.7).unwrap();
        let sum: f64 = c.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
    }

    #[test]
    fn exact_tie_breaks_lexically() {
        // Equidistant from both prototypes: CRISIS < NEUTRAL lexically.
        let c = classify(&[0.5, 0.5], &proto_pair(), 1.0).unwrap();
        assert_eq!(c.label, RegimeLabel::Crisis);
    }

    #[test]
    fn lower_temperature_sharpens() {
        let soft = classify(&[0.2, 0.2], &proto_pair(), 5.0).unwrap();
        let sharp = classify(&[0.2, 0.2], &proto_pair(), 0.1).unwrap();
        assert!(sharp.confidence > soft.confidence);
    }

    #[test]
    fn bad_temperature_rejected() {
        assert!(matches!(
            classify(&[0.0, 0.0], &proto_pair(), 0.0),
            Err(RegimeError::BadTemperature { .. })
        ));
    }

    #[test]
    fn dim_mismatch_rejected() {
        assert!(matches!(
            classify(&[0.0, 0.0, 0.0], &proto_pair(), 1.0),
            Err(RegimeError::DimMismatch { .. })
        ));
    }

    #[test]
    fn hysteresis_holds_previous_label_until_streak() {
        let prev = row(RegimeLabel::Neutral, json!({}));

        // Run 1 with a new candidate: streak 1, previous label re-persisted.
        let d1 = apply_hysteresis(Some(&prev), RegimeLabel::Crisis, 3);
        assert_eq!(d1.persist_label, RegimeLabel::Neutral);
        assert_eq!(d1.candidate_streak, 1);
        assert_eq!(d1.transition, None);

        // Run 2: streak 2.
        let prev2 = row(
            RegimeLabel::Neutral,
            json!({"candidate_label": "CRISIS", "candidate_streak": 1}),
        );
        let d2 = apply_hysteresis(Some(&prev2), RegimeLabel::Crisis, 3);
        assert_eq!(d2.persist_label, RegimeLabel::Neutral);
        assert_eq!(d2.candidate_streak, 2);

        // Run 3: gate opens, transition written.
        let prev3 = row(
            RegimeLabel::Neutral,
            json!({"candidate_label": "CRISIS", "candidate_streak": 2}),
        );
        let d3 = apply_hysteresis(Some(&prev3), RegimeLabel::Crisis, 3);
        assert_eq!(d3.persist_label, RegimeLabel::Crisis);
        assert_eq!(
            d3.transition,
            Some((RegimeLabel::Neutral, RegimeLabel::Crisis))
        );
    }

    #[test]
    fn flapping_labels_never_transition() {
        // Alternating candidates every run with hysteresis 3: the streak
        // resets to 1 on every flip, so no transition can ever fire.
        let mut prev = row(RegimeLabel::Neutral, json!({}));
        let candidates = [
            RegimeLabel::Crisis,
            RegimeLabel::Neutral,
            RegimeLabel::Crisis,
            RegimeLabel::Neutral,
            RegimeLabel::Crisis,
            RegimeLabel::Neutral,
        ];
        for cand in candidates {
            let d = apply_hysteresis(Some(&prev), cand, 3);
            assert_eq!(d.transition, None);
            assert_eq!(d.persist_label, RegimeLabel::Neutral);
            prev = row(
                d.persist_label,
                state_metadata(cand, &d, false, None),
            );
        }
    }

    #[test]
    fn first_observation_has_no_transition() {
        let d = apply_hysteresis(None, RegimeLabel::Carry, 3);
        assert_eq!(d.persist_label, RegimeLabel::Carry);
        assert_eq!(d.transition, None);
    }

    #[test]
    fn hysteresis_of_one_transitions_immediately() {
        let prev = row(RegimeLabel::Neutral, json!({}));
        let d = apply_hysteresis(Some(&prev), RegimeLabel::Carry, 1);
        assert_eq!(d.persist_label, RegimeLabel::Carry);
        assert_eq!(d.transition, Some((RegimeLabel::Neutral, RegimeLabel::Carry)));
    }

    #[test]
    fn unknown_state_is_degraded_not_error() {
        let s = unknown_state("US", "2025-03-10".parse().unwrap(), "insufficient bars");
        assert_eq!(s.regime_label, RegimeLabel::Unknown);
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.metadata["reason"], "insufficient bars");
    }

    #[test]
    fn builtin_prototypes_cover_all_classifiable_labels() {
        let p = PrototypeSet::builtin_v1();
        assert_eq!(p.labels().count(), CLASSIFIABLE.len());
        assert!(p.labels().all(|l| *l != RegimeLabel::Unknown));
    }
}
