//! Portfolio engine: scores + universe + config → long-only target weights,
//! plus scenario-based risk reporting.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::json;

use pmx_config::PortfolioConfig;
use pmx_schemas::{InstrumentScoreRow, SignalLabel, TargetPortfolioRow, UniverseMemberRow};

pub mod scenario;
mod runner;

pub use runner::run_portfolio;
pub use scenario::{scenario_risk_metrics, ScenarioSet};

const EPS: f64 = 1e-9;

/// Weight map: instrument → long-only weight.
pub type Weights = BTreeMap<String, f64>;

#[derive(Clone, Debug, PartialEq)]
pub enum PortfolioError {
    /// Built weights violate the gross-cap or per-name invariant. Indicates a
    /// construction bug, not bad input.
    ContractViolation { detail: String },
}

impl std::fmt::Display for PortfolioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortfolioError::ContractViolation { detail } => {
                write!(f, "portfolio contract violation: {detail}")
            }
        }
    }
}

impl std::error::Error for PortfolioError {}

/// Build long-only target weights.
///
/// - Only `in_universe` members with BUY/HOLD signals are candidates.
/// - Raw weight ∝ `max(score, 0)^γ`, scaled to `gross_cap`.
/// - Per-name cap with iterative renormalisation of the uncapped remainder.
/// - Empty universe or all-zero scores yield an empty map (valid outcome).
pub fn build_weights(
    universe: &[UniverseMemberRow],
    scores: &[InstrumentScoreRow],
    cfg: &PortfolioConfig,
) -> Result<Weights, PortfolioError> {
    let score_by_id: BTreeMap<&str, &InstrumentScoreRow> = scores
        .iter()
        .map(|s| (s.instrument_id.as_str(), s))
        .collect();

    let mut raw: BTreeMap<String, f64> = BTreeMap::new();
    for member in universe.iter().filter(|m| m.in_universe) {
        let Some(score) = score_by_id.get(member.instrument_id.as_str()) else {
            continue;
        };
        if !matches!(score.signal_label, SignalLabel::Buy | SignalLabel::Hold) {
            continue;
        }
        let base = score.score.max(0.0);
        if base <= 0.0 {
            continue;
        }
        raw.insert(member.instrument_id.clone(), base.powf(cfg.gamma));
    }

    if raw.is_empty() {
        return Ok(Weights::new());
    }

    let weights = cap_and_renormalize(raw, cfg.cap_name, cfg.gross_cap);
    validate_weights(&weights, cfg)?;
    Ok(weights)
}

/// Scale to the gross budget and apply the per-name cap, redistributing the
/// clipped mass across uncapped names until stable.
///
/// The loop terminates because each pass either caps at least one new name or
/// changes nothing; with every name capped the sum is `n · cap ≤ budget` and
/// redistribution stops.
fn cap_and_renormalize(raw: BTreeMap<String, f64>, cap_name: f64, gross_cap: f64) -> Weights {
    let budget = gross_cap.min(raw.len() as f64 * cap_name);
    let mut capped: BTreeMap<String, f64> = BTreeMap::new();
    let mut free: BTreeMap<String, f64> = raw;

    loop {
        let free_budget = budget - capped.values().sum::<f64>();
        let free_sum: f64 = free.values().sum();
        if free_sum <= EPS || free_budget <= EPS {
            break;
        }

        let scale = free_budget / free_sum;
        let mut newly_capped = Vec::new();
        for (id, w) in &free {
            if w * scale > cap_name + EPS {
                newly_capped.push(id.clone());
            }
        }

        if newly_capped.is_empty() {
            let scaled: Weights = free
                .iter()
                .map(|(id, w)| (id.clone(), w * scale))
                .collect();
            capped.extend(scaled);
            break;
        }
        for id in newly_capped {
            free.remove(&id);
            capped.insert(id, cap_name);
        }
    }

    capped.retain(|_, w| *w > EPS);
    capped
}

fn validate_weights(weights: &Weights, cfg: &PortfolioConfig) -> Result<(), PortfolioError> {
    let sum: f64 = weights.values().sum();
    if sum > cfg.gross_cap + 1e-9 {
        return Err(PortfolioError::ContractViolation {
            detail: format!("gross {sum:.9} exceeds cap {:.9}", cfg.gross_cap),
        });
    }
    for (id, w) in weights {
        if *w > cfg.cap_name + 1e-9 || *w < 0.0 || !w.is_finite() {
            return Err(PortfolioError::ContractViolation {
                detail: format!("weight {w:.9} for {id} outside [0, {:.9}]", cfg.cap_name),
            });
        }
    }
    Ok(())
}

/// Assemble the persisted target row.
pub fn target_row(
    portfolio_id: &str,
    as_of_date: NaiveDate,
    weights: &Weights,
    cfg: &PortfolioConfig,
) -> TargetPortfolioRow {
    TargetPortfolioRow {
        portfolio_id: portfolio_id.to_string(),
        as_of_date,
        target_positions: json!(weights),
        metadata: json!({
            "gamma": cfg.gamma,
            "cap_name": cfg.cap_name,
            "gross_cap": cfg.gross_cap,
            "names": weights.len(),
        }),
    }
}

/// Parse weights back out of a persisted target row.
pub fn weights_of_row(row: &TargetPortfolioRow) -> Weights {
    row.target_positions
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w)))
                .collect()
        })
        .unwrap_or_default()
}

/// Gross exposure grouped by sector for the risk report.
pub fn exposures_by_sector(
    weights: &Weights,
    sectors: &BTreeMap<String, String>,
) -> BTreeMap<String, f64> {
    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    for (id, w) in weights {
        let sector = sectors.get(id).cloned().unwrap_or_else(|| "UNKNOWN".into());
        *out.entry(sector).or_insert(0.0) += w;
    }
    out
}
