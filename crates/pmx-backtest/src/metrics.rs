//! Run metrics derived from the daily records and trades.
//!
//! Everything here is deterministic over its inputs; the metrics JSON
//! contains no timestamps, so identical runs are byte-identical.

use std::collections::BTreeMap;

use serde_json::json;

use crate::types::{DailyRecord, FragilitySeries, SimTrade, SleeveConfig};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub fn compute_metrics(
    cfg: &SleeveConfig,
    days: &[DailyRecord],
    trades: &[SimTrade],
    fragility: &BTreeMap<String, FragilitySeries>,
) -> serde_json::Value {
    let equities: Vec<f64> = days.iter().map(|d| d.equity).collect();
    let returns = simple_returns(&equities);

    let cumulative_return = if cfg.initial_cash > 0.0 {
        equities.last().copied().unwrap_or(cfg.initial_cash) / cfg.initial_cash - 1.0
    } else {
        0.0
    };

    let (mean, std) = mean_std(&returns);
    let sharpe = if std <= 0.0 {
        0.0
    } else {
        (mean / std) * TRADING_DAYS_PER_YEAR.sqrt()
    };

    let max_drawdown = days.iter().map(|d| d.drawdown).fold(0.0f64, f64::max);

    // Turnover: total traded notional over mean equity.
    let traded_notional: f64 = trades
        .iter()
        .map(|t| (t.quantity.abs() as f64) * t.price)
        .sum();
    let mean_equity = if equities.is_empty() {
        cfg.initial_cash
    } else {
        equities.iter().sum::<f64>() / equities.len() as f64
    };
    let turnover = if mean_equity > 0.0 {
        traded_notional / mean_equity
    } else {
        0.0
    };

    // Exposure aggregate: mean gross weight across days.
    let mean_gross: f64 = if days.is_empty() {
        0.0
    } else {
        days.iter()
            .map(|d| d.weights.values().map(|w| w.abs()).sum::<f64>())
            .sum::<f64>()
            / days.len() as f64
    };

    json!({
        "cumulative_return": cumulative_return,
        "sharpe": sharpe,
        "max_drawdown": max_drawdown,
        "turnover": turnover,
        "mean_gross_exposure": mean_gross,
        "days": days.len(),
        "trades": trades.len(),
        "by_regime": regime_buckets(days, &returns),
        "by_risk_quintile": risk_buckets(days, &returns, fragility),
    })
}

fn simple_returns(equities: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(equities.len().saturating_sub(1));
    for w in equities.windows(2) {
        let base = if w[0].abs() < 1e-12 { 1.0 } else { w[0] };
        out.push(w[1] / base - 1.0);
    }
    out
}

fn mean_std(xs: &[f64]) -> (f64, f64) {
    if xs.is_empty() {
        return (0.0, 0.0);
    }
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / xs.len() as f64;
    (mean, var.sqrt())
}

/// Mean daily return per prevailing regime label. Return `r[i]` is the move
/// into day `i + 1`, attributed to the label standing on day `i`.
fn regime_buckets(days: &[DailyRecord], returns: &[f64]) -> serde_json::Value {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for (i, r) in returns.iter().enumerate() {
        let label = days[i].regime_label.clone();
        let e = sums.entry(label).or_insert((0.0, 0));
        e.0 += r;
        e.1 += 1;
    }
    let out: BTreeMap<String, serde_json::Value> = sums
        .into_iter()
        .map(|(label, (sum, n))| {
            (
                label,
                json!({ "mean_return": sum / n as f64, "days": n }),
            )
        })
        .collect();
    json!(out)
}

/// Mean daily portfolio return bucketed by the book's exposure-weighted
/// average fragility risk score, in quintile buckets q1 (calmest) … q5.
fn risk_buckets(
    days: &[DailyRecord],
    returns: &[f64],
    fragility: &BTreeMap<String, FragilitySeries>,
) -> serde_json::Value {
    // Day-level risk: weight-averaged risk score of the held book.
    let day_risk: Vec<f64> = days
        .iter()
        .map(|d| {
            let gross: f64 = d.weights.values().map(|w| w.abs()).sum();
            if gross <= 0.0 {
                return 0.0;
            }
            d.weights
                .iter()
                .map(|(id, w)| {
                    let risk = fragility
                        .get(id)
                        .and_then(|s| s.at(d.date))
                        .map(|(_, r)| r)
                        .unwrap_or(0.0);
                    w.abs() * risk
                })
                .sum::<f64>()
                / gross
        })
        .collect();

    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for (i, r) in returns.iter().enumerate() {
        let q = quintile(day_risk[i]);
        let e = sums.entry(format!("q{q}")).or_insert((0.0, 0));
        e.0 += r;
        e.1 += 1;
    }
    let out: BTreeMap<String, serde_json::Value> = sums
        .into_iter()
        .map(|(bucket, (sum, n))| {
            (
                bucket,
                json!({ "mean_return": sum / n as f64, "days": n }),
            )
        })
        .collect();
    json!(out)
}

/// Fixed quintile edges over the unit interval. Risk scores live in [0, 1],
/// so fixed edges keep bucket membership stable across runs.
fn quintile(risk: f64) -> u8 {
    match risk {
        r if r < 0.2 => 1,
        r if r < 0.4 => 2,
        r if r < 0.6 => 3,
        r if r < 0.8 => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(date: &str, equity: f64, regime: &str) -> DailyRecord {
        DailyRecord {
            date: date.parse().unwrap(),
            equity,
            drawdown: 0.0,
            regime_label: regime.to_string(),
            weights: BTreeMap::new(),
        }
    }

    fn cfg() -> SleeveConfig {
        SleeveConfig::basic("s1", "US", "XNYS")
    }

    #[test]
    fn cumulative_return_and_sharpe() {
        let days = vec![
            day("2025-03-10", 1_000_000.0, "NEUTRAL"),
            day("2025-03-11", 1_010_000.0, "NEUTRAL"),
            day("2025-03-12", 1_020_100.0, "NEUTRAL"),
        ];
        let m = compute_metrics(&cfg(), &days, &[], &BTreeMap::new());
        assert!((m["cumulative_return"].as_f64().unwrap() - 0.0201).abs() < 1e-9);
        // Constant 1% daily returns: zero variance → sharpe defined as 0.
        assert_eq!(m["sharpe"].as_f64().unwrap(), 0.0);
        assert_eq!(m["days"], 3);
    }

    #[test]
    fn regime_buckets_attribute_forward_returns() {
        let days = vec![
            day("2025-03-10", 100.0, "CARRY"),
            day("2025-03-11", 110.0, "CRISIS"),
            day("2025-03-12", 99.0, "CRISIS"),
        ];
        let m = compute_metrics(&cfg(), &days, &[], &BTreeMap::new());
        let carry = &m["by_regime"]["CARRY"];
        assert!((carry["mean_return"].as_f64().unwrap() - 0.10).abs() < 1e-12);
        let crisis = &m["by_regime"]["CRISIS"];
        assert!((crisis["mean_return"].as_f64().unwrap() - (-0.10)).abs() < 1e-12);
    }

    #[test]
    fn turnover_scales_with_traded_notional() {
        let days = vec![day("2025-03-10", 1000.0, "NEUTRAL"), day("2025-03-11", 1000.0, "NEUTRAL")];
        let trades = vec![SimTrade {
            date: "2025-03-10".parse::<NaiveDate>().unwrap(),
            instrument_id: "A".into(),
            quantity: 10,
            price: 50.0,
        }];
        let m = compute_metrics(&cfg(), &days, &trades, &BTreeMap::new());
        assert!((m["turnover"].as_f64().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn metrics_are_deterministic() {
        let days = vec![
            day("2025-03-10", 100.0, "CARRY"),
            day("2025-03-11", 101.0, "CARRY"),
        ];
        let a = compute_metrics(&cfg(), &days, &[], &BTreeMap::new());
        let b = compute_metrics(&cfg(), &days, &[], &BTreeMap::new());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
