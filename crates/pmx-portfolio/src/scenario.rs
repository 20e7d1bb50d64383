//! Scenario-based risk metrics over target weights.
//!
//! Scenario-path generation is external; a [`ScenarioSet`] is consumed as a
//! list of per-instrument return paths.

use std::collections::BTreeMap;

use serde_json::json;

use crate::Weights;

/// One named scenario set: each path maps instrument → scenario return.
#[derive(Clone, Debug)]
pub struct ScenarioSet {
    pub id: String,
    pub paths: Vec<BTreeMap<String, f64>>,
}

/// Per-scenario P&L summary: mean, VaR95, ES95 (losses positive).
///
/// Instruments missing from a path contribute zero return (no position move).
pub fn scenario_risk_metrics(weights: &Weights, sets: &[ScenarioSet]) -> serde_json::Value {
    let mut out = serde_json::Map::new();

    for set in sets {
        let mut pnls: Vec<f64> = set
            .paths
            .iter()
            .map(|path| {
                weights
                    .iter()
                    .map(|(id, w)| w * path.get(id).copied().unwrap_or(0.0))
                    .sum()
            })
            .collect();

        if pnls.is_empty() {
            out.insert(set.id.clone(), json!(null));
            continue;
        }

        let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;

        // Sort ascending: worst P&L first.
        pnls.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let tail_len = ((pnls.len() as f64) * 0.05).ceil().max(1.0) as usize;
        let var_95 = -pnls[tail_len - 1];
        let es_95 = -(pnls[..tail_len].iter().sum::<f64>() / tail_len as f64);

        out.insert(
            set.id.clone(),
            json!({
                "mean": mean,
                "var_95": var_95,
                "es_95": es_95,
                "paths": pnls.len(),
            }),
        );
    }

    serde_json::Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> Weights {
        let mut w = Weights::new();
        w.insert("A".into(), 0.5);
        w.insert("B".into(), 0.5);
        w
    }

    fn path(a: f64, b: f64) -> BTreeMap<String, f64> {
        let mut p = BTreeMap::new();
        p.insert("A".into(), a);
        p.insert("B".into(), b);
        p
    }

    #[test]
    fn mean_var_es_from_paths() {
        let set = ScenarioSet {
            id: "macro-shock".into(),
            paths: (0..20)
                .map(|i| {
                    if i == 0 {
                        path(-0.40, -0.20) // worst: P&L -0.30
                    } else {
                        path(0.02, 0.00) // P&L +0.01
                    }
                })
                .collect(),
        };

        let m = scenario_risk_metrics(&weights(), &[set]);
        let shock = &m["macro-shock"];
        // 5% tail of 20 paths is exactly the worst path.
        assert!((shock["var_95"].as_f64().unwrap() - 0.30).abs() < 1e-12);
        assert!((shock["es_95"].as_f64().unwrap() - 0.30).abs() < 1e-12);
        let mean = shock["mean"].as_f64().unwrap();
        assert!((mean - ((-0.30) + 19.0 * 0.01) / 20.0).abs() < 1e-12);
    }

    #[test]
    fn missing_instruments_contribute_zero() {
        let set = ScenarioSet {
            id: "s".into(),
            paths: vec![{
                let mut p = BTreeMap::new();
                p.insert("A".into(), -0.1);
                p // B missing
            }],
        };
        let m = scenario_risk_metrics(&weights(), &[set]);
        assert!((m["s"]["var_95"].as_f64().unwrap() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn empty_set_is_null() {
        let set = ScenarioSet { id: "empty".into(), paths: vec![] };
        let m = scenario_risk_metrics(&weights(), &[set]);
        assert!(m["empty"].is_null());
    }
}
