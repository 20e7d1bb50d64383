//! Universe engine: ranked, filtered membership with stability gates and an
//! optional λ̂ cluster bonus. Every adjustment leaves an entry in the
//! member's reasons ledger.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::json;

use pmx_config::UniverseConfig;
use pmx_schemas::{SoftTargetClass, UniverseMemberRow};

mod runner;
pub use runner::run_universe;

/// Default universe id for a region.
pub fn core_universe_id(region: &str) -> String {
    format!("CORE_EQ_{region}")
}

/// One base-pool instrument with everything the filter pipeline looks at.
#[derive(Clone, Debug)]
pub struct UniverseCandidate {
    pub instrument_id: String,
    pub sector: String,
    pub last_price: Option<f64>,
    /// Average daily dollar volume.
    pub adv: Option<f64>,
    pub active: bool,
    pub restricted: bool,
    pub stab_class: Option<SoftTargetClass>,
    pub stab_confidence: f64,
    pub stab_risk_score: f64,
    /// Base rank score (assessment score).
    pub base_score: f64,
    pub cluster: Option<String>,
}

struct Scored {
    candidate: UniverseCandidate,
    composite: f64,
    reasons: Vec<String>,
    excluded: bool,
}

/// Build the universe for one `(universe_id, as_of_date)`.
///
/// Steps: structural filters → STAB static filter → STAB dynamic penalty →
/// λ̂ cluster bonus → sector cap → total cap. Deterministic tie-break:
/// higher composite score, then lexicographic instrument id.
///
/// Output contains one row per base-pool candidate; excluded members carry
/// `in_universe = false`, rank 0 and the reason that cut them.
pub fn build_universe(
    universe_id: &str,
    as_of_date: NaiveDate,
    candidates: &[UniverseCandidate],
    lambda_scores: Option<&BTreeMap<String, f64>>,
    cfg: &UniverseConfig,
) -> Vec<UniverseMemberRow> {
    let mut scored: Vec<Scored> = candidates
        .iter()
        .map(|c| evaluate_candidate(c, lambda_scores, cfg))
        .collect();

    // Deterministic order for the capping passes.
    scored.sort_by(|a, b| {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate.instrument_id.cmp(&b.candidate.instrument_id))
    });

    // Sector cap, then total cap, by rank order.
    let mut sector_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut kept = 0usize;
    for s in scored.iter_mut() {
        if s.excluded {
            continue;
        }
        let sector_count = sector_counts.entry(s.candidate.sector.clone()).or_insert(0);
        if *sector_count >= cfg.max_names_per_sector {
            s.excluded = true;
            s.reasons.push(format!(
                "sector_cap: {} already at {}",
                s.candidate.sector, cfg.max_names_per_sector
            ));
            continue;
        }
        if kept >= cfg.max_universe_size {
            s.excluded = true;
            s.reasons
                .push(format!("size_cap: universe already at {}", cfg.max_universe_size));
            continue;
        }
        *sector_count += 1;
        kept += 1;
    }

    // Emit rows: members first in rank order, then excluded candidates.
    let mut rank = 0i32;
    scored
        .iter()
        .map(|s| {
            let in_universe = !s.excluded;
            if in_universe {
                rank += 1;
            }
            UniverseMemberRow {
                universe_id: universe_id.to_string(),
                instrument_id: s.candidate.instrument_id.clone(),
                as_of_date,
                in_universe,
                rank: if in_universe { rank } else { 0 },
                scores: json!({
                    "base": s.candidate.base_score,
                    "composite": s.composite,
                }),
                reasons: json!(s.reasons),
            }
        })
        .collect()
}

fn evaluate_candidate(
    c: &UniverseCandidate,
    lambda_scores: Option<&BTreeMap<String, f64>>,
    cfg: &UniverseConfig,
) -> Scored {
    let mut reasons = Vec::new();
    let mut excluded = false;

    // Structural filters.
    if !c.active {
        excluded = true;
        reasons.push("structural: inactive or delisted".to_string());
    }
    if c.restricted {
        excluded = true;
        reasons.push("structural: restricted".to_string());
    }
    match c.last_price {
        Some(p) if p >= cfg.min_price => {}
        Some(p) => {
            excluded = true;
            reasons.push(format!("structural: price {p:.2} below min {:.2}", cfg.min_price));
        }
        None => {
            excluded = true;
            reasons.push("structural: no price".to_string());
        }
    }
    if cfg.min_liquidity_adv > 0.0 {
        match c.adv {
            Some(adv) if adv >= cfg.min_liquidity_adv => {}
            Some(adv) => {
                excluded = true;
                reasons.push(format!(
                    "structural: adv {adv:.0} below min {:.0}",
                    cfg.min_liquidity_adv
                ));
            }
            None => {
                excluded = true;
                reasons.push("structural: no liquidity data".to_string());
            }
        }
    }

    // STAB static filter: drop Breaker always, Fragile with weak profile.
    match c.stab_class {
        Some(SoftTargetClass::Breaker) => {
            excluded = true;
            reasons.push("stab: class BREAKER".to_string());
        }
        Some(SoftTargetClass::Fragile) if c.stab_confidence < cfg.fragile_min_confidence => {
            excluded = true;
            reasons.push(format!(
                "stab: FRAGILE with confidence {:.2} below {:.2}",
                c.stab_confidence, cfg.fragile_min_confidence
            ));
        }
        _ => {}
    }

    // STAB dynamic penalty.
    let mut composite = c.base_score;
    if cfg.w_stab > 0.0 && c.stab_risk_score > 0.0 {
        let factor = 1.0 - cfg.w_stab * c.stab_risk_score.clamp(0.0, 1.0);
        composite *= factor;
        reasons.push(format!(
            "stab_penalty: x{:.4} (risk {:.3})",
            factor, c.stab_risk_score
        ));
    }

    // λ̂ cluster bonus.
    if cfg.w_lambda > 0.0 {
        if let (Some(cluster), Some(scores)) = (&c.cluster, lambda_scores) {
            if let Some(lambda) = scores.get(cluster) {
                composite += cfg.w_lambda * lambda;
                reasons.push(format!("lambda_bonus: +{:.4} ({cluster})", cfg.w_lambda * lambda));
            }
        }
    }

    Scored {
        candidate: c.clone(),
        composite,
        reasons,
        excluded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, score: f64) -> UniverseCandidate {
        UniverseCandidate {
            instrument_id: id.to_string(),
            sector: "TECH".to_string(),
            last_price: Some(50.0),
            adv: Some(1_000_000.0),
            active: true,
            restricted: false,
            stab_class: None,
            stab_confidence: 1.0,
            stab_risk_score: 0.0,
            base_score: score,
            cluster: None,
        }
    }

    fn date() -> NaiveDate {
        "2025-03-10".parse().unwrap()
    }

    #[test]
    fn ranks_by_score_then_id() {
        let cfg = UniverseConfig::default();
        let rows = build_universe(
            "CORE_EQ_US",
            date(),
            &[cand("B", 0.5), cand("A", 0.5), cand("C", 0.9)],
            None,
            &cfg,
        );
        let ids: Vec<&str> = rows
            .iter()
            .filter(|r| r.in_universe)
            .map(|r| r.instrument_id.as_str())
            .collect();
        // C first (higher score); A before B (lexicographic tie-break).
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 2);
        assert_eq!(rows[2].rank, 3);
    }

    #[test]
    fn structural_filters_exclude_with_reasons() {
        let cfg = UniverseConfig {
            min_price: 10.0,
            min_liquidity_adv: 500_000.0,
            ..UniverseConfig::default()
        };
        let mut cheap = cand("CHEAP", 0.9);
        cheap.last_price = Some(2.0);
        let mut illiquid = cand("THIN", 0.9);
        illiquid.adv = Some(100.0);
        let mut dead = cand("DEAD", 0.9);
        dead.active = false;

        let rows = build_universe("U", date(), &[cheap, illiquid, dead], None, &cfg);
        assert!(rows.iter().all(|r| !r.in_universe));
        for r in &rows {
            let reasons = r.reasons.as_array().unwrap();
            assert!(!reasons.is_empty(), "excluded member must carry a reason");
            assert_eq!(r.rank, 0);
        }
    }

    #[test]
    fn breaker_always_dropped_fragile_needs_confidence() {
        let cfg = UniverseConfig::default();
        let mut breaker = cand("BRK", 0.9);
        breaker.stab_class = Some(SoftTargetClass::Breaker);
        let mut weak_fragile = cand("WF", 0.9);
        weak_fragile.stab_class = Some(SoftTargetClass::Fragile);
        weak_fragile.stab_confidence = 0.1;
        let mut ok_fragile = cand("OF", 0.9);
        ok_fragile.stab_class = Some(SoftTargetClass::Fragile);
        ok_fragile.stab_confidence = 0.9;

        let rows = build_universe("U", date(), &[breaker, weak_fragile, ok_fragile], None, &cfg);
        let by_id: BTreeMap<_, _> = rows.iter().map(|r| (r.instrument_id.clone(), r)).collect();
        assert!(!by_id["BRK"].in_universe);
        assert!(!by_id["WF"].in_universe);
        assert!(by_id["OF"].in_universe);
    }

    #[test]
    fn stab_penalty_reorders() {
        let cfg = UniverseConfig {
            w_stab: 0.5,
            ..UniverseConfig::default()
        };
        let mut risky = cand("RISKY", 0.8);
        risky.stab_risk_score = 0.9; // composite 0.8 × (1 − 0.45) = 0.44
        let calm = cand("CALM", 0.5);

        let rows = build_universe("U", date(), &[risky, calm], None, &cfg);
        let members: Vec<&str> = rows
            .iter()
            .filter(|r| r.in_universe)
            .map(|r| r.instrument_id.as_str())
            .collect();
        assert_eq!(members, vec!["CALM", "RISKY"]);
    }

    #[test]
    fn lambda_bonus_applies_when_provider_present() {
        let cfg = UniverseConfig {
            w_lambda: 1.0,
            ..UniverseConfig::default()
        };
        let mut a = cand("A", 0.5);
        a.cluster = Some("energy".to_string());
        let b = cand("B", 0.6);

        let mut lambda = BTreeMap::new();
        lambda.insert("energy".to_string(), 0.3);

        let rows = build_universe("U", date(), &[a.clone(), b.clone()], Some(&lambda), &cfg);
        let first = rows.iter().find(|r| r.rank == 1).unwrap();
        assert_eq!(first.instrument_id, "A"); // 0.5 + 0.3 > 0.6

        // Without the provider the bonus vanishes.
        let rows = build_universe("U", date(), &[a, b], None, &cfg);
        let first = rows.iter().find(|r| r.rank == 1).unwrap();
        assert_eq!(first.instrument_id, "B");
    }

    #[test]
    fn sector_and_size_caps() {
        let cfg = UniverseConfig {
            max_names_per_sector: 2,
            max_universe_size: 3,
            ..UniverseConfig::default()
        };
        let mut candidates = vec![
            cand("T1", 0.9),
            cand("T2", 0.8),
            cand("T3", 0.7), // third TECH: sector-capped
        ];
        let mut f1 = cand("F1", 0.6);
        f1.sector = "FIN".to_string();
        let mut f2 = cand("F2", 0.5);
        f2.sector = "FIN".to_string(); // would be 4th member: size-capped
        candidates.push(f1);
        candidates.push(f2);

        let rows = build_universe("U", date(), &candidates, None, &cfg);
        let members: Vec<&str> = rows
            .iter()
            .filter(|r| r.in_universe)
            .map(|r| r.instrument_id.as_str())
            .collect();
        assert_eq!(members, vec!["T1", "T2", "F1"]);

        let t3 = rows.iter().find(|r| r.instrument_id == "T3").unwrap();
        assert!(t3.reasons.to_string().contains("sector_cap"));
        let f2 = rows.iter().find(|r| r.instrument_id == "F2").unwrap();
        assert!(f2.reasons.to_string().contains("size_cap"));
    }

    #[test]
    fn core_universe_id_format() {
        assert_eq!(core_universe_id("US"), "CORE_EQ_US");
    }
}
