//! Risk service: apply per-name, sector and gross caps to proposed weights.
//!
//! Pure deterministic logic: same inputs → same outputs and same action log.
//! The caller supplies the timestamp so replays produce identical rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use pmx_config::RiskLimitsConfig;
use pmx_schemas::{RiskActionRow, RiskActionType};

const EPS: f64 = 1e-9;

/// Result of a risk pass: adjusted weights plus the full action log.
#[derive(Clone, Debug)]
pub struct RiskOutcome {
    pub adjusted: BTreeMap<String, f64>,
    pub actions: Vec<RiskActionRow>,
}

impl RiskOutcome {
    pub fn action_for(&self, instrument_id: &str) -> Option<&RiskActionRow> {
        // The last action for an instrument reflects its final disposition.
        self.actions
            .iter()
            .rev()
            .find(|a| a.instrument_id == instrument_id)
    }
}

/// Apply the risk limits to proposed weights.
///
/// Per instrument:
/// - `|w| ≤ cap` → OK, unchanged.
/// - `|w| > cap` → clipped to cap with sign, CAPPED.
/// - banned or `cap = 0` → set to 0, REJECTED.
///
/// Then sector caps (proportional scaling within a sector, SCALED per
/// affected name), then the gross cap (proportional scaling across the book,
/// SCALED per affected name).
pub fn apply_risk(
    strategy_id: &str,
    proposed: &BTreeMap<String, f64>,
    sectors: &BTreeMap<String, String>,
    decision_id: Option<Uuid>,
    now: DateTime<Utc>,
    cfg: &RiskLimitsConfig,
) -> RiskOutcome {
    let mut actions = Vec::new();
    let mut adjusted: BTreeMap<String, f64> = BTreeMap::new();

    let action = |instrument_id: &str,
                      action_type: RiskActionType,
                      original: f64,
                      new: f64,
                      reason: String,
                      actions: &mut Vec<RiskActionRow>| {
        actions.push(RiskActionRow {
            strategy_id: strategy_id.to_string(),
            instrument_id: instrument_id.to_string(),
            decision_id,
            action_type,
            original_weight: original,
            adjusted_weight: new,
            reason,
            created_at: now,
        });
    };

    // Pass 1: per-name resolution.
    for (id, w) in proposed {
        let banned = cfg.banned_instruments.iter().any(|b| b == id);
        if banned || cfg.per_name_cap <= 0.0 {
            action(
                id,
                RiskActionType::Rejected,
                *w,
                0.0,
                if banned {
                    "instrument banned".to_string()
                } else {
                    "per-name cap is zero".to_string()
                },
                &mut actions,
            );
            adjusted.insert(id.clone(), 0.0);
        } else if w.abs() > cfg.per_name_cap + EPS {
            let clipped = cfg.per_name_cap * w.signum();
            action(
                id,
                RiskActionType::Capped,
                *w,
                clipped,
                format!("per-name cap {:.4}", cfg.per_name_cap),
                &mut actions,
            );
            adjusted.insert(id.clone(), clipped);
        } else {
            action(id, RiskActionType::Ok, *w, *w, String::new(), &mut actions);
            adjusted.insert(id.clone(), *w);
        }
    }

    // Pass 2: sector caps.
    for (sector, cap) in &cfg.sector_caps {
        let members: Vec<String> = adjusted
            .keys()
            .filter(|id| sectors.get(*id) == Some(sector))
            .cloned()
            .collect();
        let gross: f64 = members.iter().map(|id| adjusted[id].abs()).sum();
        if gross > cap + EPS && gross > 0.0 {
            let scale = cap / gross;
            for id in members {
                let old = adjusted[&id];
                let new = old * scale;
                if (old - new).abs() > EPS {
                    action(
                        &id,
                        RiskActionType::Scaled,
                        old,
                        new,
                        format!("sector cap {sector} {:.4}", cap),
                        &mut actions,
                    );
                    adjusted.insert(id, new);
                }
            }
        }
    }

    // Pass 3: gross cap.
    let gross: f64 = adjusted.values().map(|w| w.abs()).sum();
    if gross > cfg.gross_cap + EPS && gross > 0.0 {
        let scale = cfg.gross_cap / gross;
        let ids: Vec<String> = adjusted.keys().cloned().collect();
        for id in ids {
            let old = adjusted[&id];
            let new = old * scale;
            if (old - new).abs() > EPS {
                action(
                    &id,
                    RiskActionType::Scaled,
                    old,
                    new,
                    format!("gross cap {:.4}", cfg.gross_cap),
                    &mut actions,
                );
                adjusted.insert(id, new);
            }
        }
    }

    adjusted.retain(|_, w| w.abs() > EPS);
    RiskOutcome { adjusted, actions }
}
