//! Stability engine: per-entity vulnerability scoring, Soft Target Index,
//! class gates, state-change risk forecast, fragility measure.
//!
//! Pure scoring and gate logic live here; `runner` is the persistence rim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use pmx_config::StabilityConfig;
use pmx_schemas::SoftTargetClass;

pub mod forecast;
mod runner;

pub use forecast::{StateChangeForecast, TransitionMatrix};
pub use runner::{run_stability, EntityInput};

const EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Static profile & features
// ---------------------------------------------------------------------------

/// Static entity profile from the curated registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_id: String,
    pub entity_type: String,
    /// How systemically important the entity is, in `(0, 1]`.
    pub criticality: f64,
    /// Capacity to absorb stress, in `(0, 1]`. STI divides by this.
    pub resilience: f64,
    pub sector: String,
}

/// Named feature map. Keys are entity-type-specific; absent features
/// contribute their neutral value, never an error.
pub type StabilityFeatures = BTreeMap<String, f64>;

fn feat(features: &StabilityFeatures, key: &str, default: f64) -> f64 {
    let v = features.get(key).copied().unwrap_or(default);
    if v.is_finite() {
        v
    } else {
        default
    }
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Sub-scores
// ---------------------------------------------------------------------------

/// Four vulnerability sub-scores, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubScores {
    pub financial: f64,
    pub political: f64,
    pub operational: f64,
    pub attack_surface: f64,
}

impl SubScores {
    /// Mean of the three vulnerability dims (attack surface is a separate
    /// multiplier in the STI).
    pub fn mean_vulnerability(&self) -> f64 {
        (self.financial + self.political + self.operational) / 3.0
    }

    pub fn dims(&self) -> [f64; 4] {
        [self.financial, self.political, self.operational, self.attack_surface]
    }

    /// Count of sub-scores at or above the dimension threshold
    /// (confirmation-gate input).
    pub fn dims_above(&self, threshold: f64) -> u32 {
        self.dims().iter().filter(|d| **d >= threshold).count() as u32
    }
}

/// Compute the four sub-scores from the entity's feature map.
///
/// Feature keys per dimension (all optional, neutral when absent):
/// - financial: `cds_spread_bps`, `leverage_ratio`, `liquidity_coverage`
/// - political: `regime_instability`, `sanction_pressure`
/// - operational: `dependency_concentration`, `spof_count`
/// - attack surface: `short_interest_ratio`, `derivative_exposure`
pub fn compute_sub_scores(features: &StabilityFeatures) -> SubScores {
    // CDS: 0 at 0bps, saturates toward 1 around 1000bps.
    let cds = clamp01(feat(features, "cds_spread_bps", 0.0) / 1000.0);
    // Leverage: neutral below 2x, saturates at 10x.
    let lev = clamp01((feat(features, "leverage_ratio", 0.0) - 2.0) / 8.0);
    // Liquidity coverage: 1.0 coverage is neutral; below 1 raises the score.
    let liq = clamp01(1.0 - feat(features, "liquidity_coverage", 1.0));
    let financial = clamp01(0.5 * cds + 0.3 * lev + 0.2 * liq);

    let regime = clamp01(feat(features, "regime_instability", 0.0));
    let sanction = clamp01(feat(features, "sanction_pressure", 0.0));
    let political = clamp01(0.7 * regime + 0.3 * sanction);

    let dep = clamp01(feat(features, "dependency_concentration", 0.0));
    // SPOFs: saturates at 5 single points of failure.
    let spof = clamp01(feat(features, "spof_count", 0.0) / 5.0);
    let operational = clamp01(0.6 * dep + 0.4 * spof);

    let short_interest = clamp01(feat(features, "short_interest_ratio", 0.0));
    let deriv = clamp01(feat(features, "derivative_exposure", 0.0));
    let attack_surface = clamp01(0.6 * short_interest + 0.4 * deriv);

    SubScores {
        financial,
        political,
        operational,
        attack_surface,
    }
}

// ---------------------------------------------------------------------------
// Soft Target Index
// ---------------------------------------------------------------------------

/// `STI = 100 · (criticality · mean(vulnerabilities) · attack_surface)
///            / max(resilience, ε)`, clipped to `[0, 100]`.
pub fn soft_target_index(profile: &EntityProfile, scores: &SubScores) -> f64 {
    let raw = 100.0 * (profile.criticality * scores.mean_vulnerability() * scores.attack_surface)
        / profile.resilience.max(EPS);
    raw.clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Raw class from the STI alone (no gates):
/// Stable < 30 ≤ Watch < 45 ≤ Fragile < 60 ≤ Targetable < 75 ≤ Breaker.
pub fn classify_sti(sti: f64, thresholds: &[f64; 4]) -> SoftTargetClass {
    if sti >= thresholds[3] {
        SoftTargetClass::Breaker
    } else if sti >= thresholds[2] {
        SoftTargetClass::Targetable
    } else if sti >= thresholds[1] {
        SoftTargetClass::Fragile
    } else if sti >= thresholds[0] {
        SoftTargetClass::Watch
    } else {
        SoftTargetClass::Stable
    }
}

/// Lower STI bound of a class (Stable has none).
fn entry_threshold(class: SoftTargetClass, thresholds: &[f64; 4]) -> Option<f64> {
    match class {
        SoftTargetClass::Stable => None,
        SoftTargetClass::Watch => Some(thresholds[0]),
        SoftTargetClass::Fragile => Some(thresholds[1]),
        SoftTargetClass::Targetable => Some(thresholds[2]),
        SoftTargetClass::Breaker => Some(thresholds[3]),
    }
}

/// Outcome of the gated classification for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct GatedClass {
    pub class: SoftTargetClass,
    /// Consecutive runs (incl. this one) the STI has held at or above the
    /// granted class's entry threshold. 0 for Stable.
    pub persistence_days: i32,
    /// Raw (ungated) class, for the breakdown payload.
    pub raw_class: SoftTargetClass,
}

/// Consecutive trailing runs (incl. the last) with STI ≥ bound.
fn trailing_streak_at_or_above(sti_history: &[f64], bound: f64) -> u32 {
    sti_history
        .iter()
        .rev()
        .take_while(|s| **s >= bound)
        .count() as u32
}

/// Apply the persistence and confirmation gates.
///
/// `sti_history` is oldest→newest and must include the current run's STI as
/// its last element.
///
/// Gate rules:
/// - Classes at or below Watch are granted immediately.
/// - Downgrades (raw below the previous class) are always immediate.
/// - An upgrade to class C above Watch requires the STI to have held at or
///   above the entry threshold of the class below C for `persistence_days(C)`
///   consecutive runs.
/// - Targetable/Breaker additionally require `confirmation_min_dims`
///   sub-scores at or above the dimension threshold.
/// - When the raw class fails its gates, the highest lower class whose gates
///   pass is granted instead.
pub fn apply_class_gates(
    sti_history: &[f64],
    scores: &SubScores,
    prev_class: Option<SoftTargetClass>,
    cfg: &StabilityConfig,
) -> GatedClass {
    debug_assert!(!sti_history.is_empty(), "sti_history must include current run");
    let sti = *sti_history.last().unwrap_or(&0.0);
    let raw = classify_sti(sti, &cfg.sti_thresholds);

    // Downgrade or hold: immediate.
    if let Some(prev) = prev_class {
        if raw <= prev {
            return granted(raw, sti_history, cfg);
        }
    }

    // Upgrade path: walk candidates from raw downward to the first class
    // whose gates pass.
    let mut candidate = raw;
    loop {
        if candidate <= SoftTargetClass::Watch {
            return granted(candidate, sti_history, cfg);
        }

        let below = SoftTargetClass::from_index(candidate.index() - 1)
            .expect("candidate above Watch always has a class below");
        let persistence_bound = entry_threshold(below, &cfg.sti_thresholds)
            .expect("class below an above-Watch candidate has an entry threshold");
        let required = cfg.persistence_for(candidate.as_str());
        let streak = trailing_streak_at_or_above(sti_history, persistence_bound);
        let persistence_ok = streak >= required;

        let confirmation_ok = if candidate >= SoftTargetClass::Targetable {
            scores.dims_above(cfg.dim_threshold) >= cfg.confirmation_min_dims
        } else {
            true
        };

        if persistence_ok && confirmation_ok {
            return granted(candidate, sti_history, cfg);
        }

        candidate = below;
    }
}

fn granted(class: SoftTargetClass, sti_history: &[f64], cfg: &StabilityConfig) -> GatedClass {
    let sti = *sti_history.last().unwrap_or(&0.0);
    let persistence_days = match entry_threshold(class, &cfg.sti_thresholds) {
        Some(bound) => trailing_streak_at_or_above(sti_history, bound) as i32,
        None => 0,
    };
    GatedClass {
        class,
        persistence_days,
        raw_class: classify_sti(sti, &cfg.sti_thresholds),
    }
}

// ---------------------------------------------------------------------------
// Fragility measure
// ---------------------------------------------------------------------------

/// Affine combination of STI and state-change risk, in `[0, 1]`, with class
/// buckets mirroring the soft-target thresholds.
pub fn fragility_measure(
    sti: f64,
    risk_score: f64,
    thresholds: &[f64; 4],
) -> (f64, SoftTargetClass) {
    let alpha = clamp01(0.6 * (sti / 100.0) + 0.4 * risk_score);
    let class = classify_sti(alpha * 100.0, thresholds);
    (alpha, class)
}

/// Breakdown payload persisted with the stability vector.
pub fn breakdown_json(profile: &EntityProfile, scores: &SubScores, gated: &GatedClass) -> serde_json::Value {
    json!({
        "criticality": profile.criticality,
        "resilience": profile.resilience,
        "mean_vulnerability": scores.mean_vulnerability(),
        "raw_class": gated.raw_class.as_str(),
        "granted_class": gated.class.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(persistence: u32) -> StabilityConfig {
        let mut c = StabilityConfig::default();
        for class in ["FRAGILE", "TARGETABLE", "BREAKER"] {
            c.persistence_days.insert(class.into(), persistence);
        }
        c
    }

    fn profile() -> EntityProfile {
        EntityProfile {
            entity_id: "X".into(),
            entity_type: "SOVEREIGN".into(),
            criticality: 0.9,
            resilience: 0.5,
            sector: "GOV".into(),
        }
    }

    fn elevated_scores() -> SubScores {
        SubScores {
            financial: 0.8,
            political: 0.7,
            operational: 0.3,
            attack_surface: 0.9,
        }
    }

    fn calm_scores() -> SubScores {
        SubScores {
            financial: 0.3,
            political: 0.2,
            operational: 0.2,
            attack_surface: 0.4,
        }
    }

    #[test]
    fn sub_scores_are_clamped() {
        let mut f = StabilityFeatures::new();
        f.insert("cds_spread_bps".into(), 50_000.0);
        f.insert("leverage_ratio".into(), 100.0);
        f.insert("liquidity_coverage".into(), -5.0);
        f.insert("short_interest_ratio".into(), 9.0);
        let s = compute_sub_scores(&f);
        for d in s.dims() {
            assert!((0.0..=1.0).contains(&d), "dim out of range: {d}");
        }
        assert_eq!(s.financial, 1.0);
    }

    #[test]
    fn missing_features_are_neutral_not_errors() {
        let s = compute_sub_scores(&StabilityFeatures::new());
        assert_eq!(s.financial, 0.0);
        assert_eq!(s.political, 0.0);
    }

    #[test]
    fn non_finite_features_fall_back_to_neutral() {
        let mut f = StabilityFeatures::new();
        f.insert("cds_spread_bps".into(), f64::NAN);
        let s = compute_sub_scores(&f);
        assert_eq!(s.financial, 0.0);
    }

    #[test]
    fn sti_is_clipped_and_divides_by_resilience() {
        let p = profile();
        let s = elevated_scores();
        let sti = soft_target_index(&p, &s);
        assert!((0.0..=100.0).contains(&sti));

        let fragile_profile = EntityProfile {
            resilience: 0.01,
            ..profile()
        };
        assert_eq!(soft_target_index(&fragile_profile, &s), 100.0);
    }

    #[test]
    fn classify_sti_threshold_edges() {
        let t = [30.0, 45.0, 60.0, 75.0];
        assert_eq!(classify_sti(29.9, &t), SoftTargetClass::Stable);
        assert_eq!(classify_sti(30.0, &t), SoftTargetClass::Watch);
        assert_eq!(classify_sti(44.9, &t), SoftTargetClass::Watch);
        assert_eq!(classify_sti(45.0, &t), SoftTargetClass::Fragile);
        assert_eq!(classify_sti(60.0, &t), SoftTargetClass::Targetable);
        assert_eq!(classify_sti(75.0, &t), SoftTargetClass::Breaker);
        assert_eq!(classify_sti(100.0, &t), SoftTargetClass::Breaker);
    }

    /// Persistence-gate seed scenario: STI series [40, 50, 55, 62] with
    /// persistence 2 and confirmation dims elevating on day 3 yields
    /// [Watch, Fragile, Fragile, Targetable].
    #[test]
    fn persistence_gate_scenario() {
        let cfg = cfg(2);
        let series = [40.0, 50.0, 55.0, 62.0];

        // Day 1: Watch.
        let d1 = apply_class_gates(&series[..1], &calm_scores(), None, &cfg);
        assert_eq!(d1.class, SoftTargetClass::Watch);

        // Day 2: Fragile (STI held ≥ 30 for two runs).
        let d2 = apply_class_gates(&series[..2], &calm_scores(), Some(d1.class), &cfg);
        assert_eq!(d2.class, SoftTargetClass::Fragile);

        // Day 3: raw is still Fragile; sub-scores elevate but no upgrade yet.
        let d3 = apply_class_gates(&series[..3], &elevated_scores(), Some(d2.class), &cfg);
        assert_eq!(d3.class, SoftTargetClass::Fragile);

        // Day 4: Targetable — persistence (≥45 since day 2) + confirmation met.
        let d4 = apply_class_gates(&series[..4], &elevated_scores(), Some(d3.class), &cfg);
        assert_eq!(d4.class, SoftTargetClass::Targetable);
    }

    #[test]
    fn targetable_denied_without_confirmation() {
        let cfg = cfg(2);
        // Persistence satisfied, but only one dim elevated.
        let one_dim = SubScores {
            financial: 0.9,
            political: 0.1,
            operational: 0.1,
            attack_surface: 0.2,
        };
        let d = apply_class_gates(
            &[50.0, 55.0, 62.0],
            &one_dim,
            Some(SoftTargetClass::Fragile),
            &cfg,
        );
        assert_eq!(d.class, SoftTargetClass::Fragile);
    }

    #[test]
    fn single_spike_cannot_enter_targetable() {
        let cfg = cfg(2);
        // One run at 70 out of nowhere: persistence fails for Targetable and
        // Fragile alike, so the entity lands at Watch.
        let d = apply_class_gates(&[70.0], &elevated_scores(), None, &cfg);
        assert_eq!(d.class, SoftTargetClass::Watch);
    }

    #[test]
    fn downgrade_is_immediate() {
        let cfg = cfg(3);
        let d = apply_class_gates(
            &[62.0, 62.0, 62.0, 20.0],
            &calm_scores(),
            Some(SoftTargetClass::Targetable),
            &cfg,
        );
        assert_eq!(d.class, SoftTargetClass::Stable);
        assert_eq!(d.persistence_days, 0);
    }

    #[test]
    fn persistence_counter_reported_on_granted_class() {
        let cfg = cfg(2);
        let d = apply_class_gates(&[40.0, 50.0], &calm_scores(), Some(SoftTargetClass::Watch), &cfg);
        assert_eq!(d.class, SoftTargetClass::Fragile);
        // Both runs held ≥ 45? Only the last one: streak at Fragile's own
        // entry bound (45) is 1.
        assert_eq!(d.persistence_days, 1);
    }

    #[test]
    fn fragility_measure_buckets_mirror_classes() {
        let t = [30.0, 45.0, 60.0, 75.0];
        let (alpha, class) = fragility_measure(0.0, 0.0, &t);
        assert_eq!(alpha, 0.0);
        assert_eq!(class, SoftTargetClass::Stable);

        let (alpha, class) = fragility_measure(100.0, 1.0, &t);
        assert_eq!(alpha, 1.0);
        assert_eq!(class, SoftTargetClass::Breaker);

        let (alpha, class) = fragility_measure(80.0, 0.3, &t);
        assert!((alpha - 0.6).abs() < 1e-12);
        assert_eq!(class, SoftTargetClass::Targetable);
    }
}
