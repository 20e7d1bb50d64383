//! Meta-orchestrator: rank persisted backtest runs by a selection policy and
//! record the decision. Never mutates sleeves or re-executes the pipeline.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use pmx_schemas::{BacktestRunRow, EngineDecisionRow};

pub const ENGINE_NAME: &str = "META_ORCHESTRATOR";

/// Supported ranking policies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Highest annualised Sharpe.
    TopKSharpe,
    /// Highest mean return in the top risk bucket minus the bottom bucket.
    TopKLambdaUplift,
    /// Smallest standard deviation of per-bucket mean returns.
    TopKLambdaRobust,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::TopKSharpe => "select_top_k_sharpe",
            SelectionPolicy::TopKLambdaUplift => "select_top_k_lambda_uplift",
            SelectionPolicy::TopKLambdaRobust => "select_top_k_lambda_robust",
        }
    }
}

/// A run with its policy score. Higher is better for every policy (robust
/// negates the dispersion).
#[derive(Clone, Debug)]
pub struct RankedRun {
    pub run_id: Uuid,
    pub sleeve_id: String,
    pub score: f64,
}

/// Rank runs under a policy, best first. Runs whose metrics lack the fields
/// a policy needs score negative infinity and sink to the bottom — a missing
/// metric is never a selection.
///
/// Tie-break: lexicographic sleeve id, then run id.
pub fn rank_runs(runs: &[BacktestRunRow], policy: SelectionPolicy) -> Vec<RankedRun> {
    let mut ranked: Vec<RankedRun> = runs
        .iter()
        .map(|r| RankedRun {
            run_id: r.run_id,
            sleeve_id: r.sleeve_id.clone(),
            score: policy_score(r, policy),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sleeve_id.cmp(&b.sleeve_id))
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
    ranked
}

fn policy_score(run: &BacktestRunRow, policy: SelectionPolicy) -> f64 {
    let m = &run.metrics_json;
    match policy {
        SelectionPolicy::TopKSharpe => m
            .get("sharpe")
            .and_then(|v| v.as_f64())
            .filter(|s| s.is_finite())
            .unwrap_or(f64::NEG_INFINITY),
        SelectionPolicy::TopKLambdaUplift => {
            let buckets = bucket_means(m);
            match (buckets.last(), buckets.first()) {
                (Some((_, top)), Some((_, bottom))) if buckets.len() >= 2 => top - bottom,
                _ => f64::NEG_INFINITY,
            }
        }
        SelectionPolicy::TopKLambdaRobust => {
            let buckets = bucket_means(m);
            if buckets.len() < 2 {
                return f64::NEG_INFINITY;
            }
            let values: Vec<f64> = buckets.iter().map(|(_, v)| *v).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
                / values.len() as f64;
            // Smaller dispersion ranks higher.
            -var.sqrt()
        }
    }
}

/// Risk-bucket means sorted by bucket name (q1 … q5).
fn bucket_means(metrics: &serde_json::Value) -> Vec<(String, f64)> {
    let Some(obj) = metrics.get("by_risk_quintile").and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    let mut out: Vec<(String, f64)> = obj
        .iter()
        .filter_map(|(k, v)| {
            v.get("mean_return")
                .and_then(|m| m.as_f64())
                .map(|m| (k.clone(), m))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Select the top-k runs for a strategy and record a `META_ORCHESTRATOR`
/// decision with the selected run ids.
pub async fn select_top_k(
    pool: &PgPool,
    strategy_id: &str,
    policy: SelectionPolicy,
    k: usize,
) -> Result<Vec<RankedRun>> {
    let runs = pmx_db::read_backtest_runs(pool, strategy_id)
        .await
        .context("meta run read failed")?;
    let ranked = rank_runs(&runs, policy);
    let selected: Vec<RankedRun> = ranked.into_iter().take(k).collect();

    let selected_ids: Vec<String> = selected.iter().map(|r| r.run_id.to_string()).collect();
    pmx_db::insert_engine_decision(
        pool,
        &EngineDecisionRow {
            decision_id: Uuid::new_v4(),
            engine_name: ENGINE_NAME.to_string(),
            strategy_id: strategy_id.to_string(),
            created_at: Utc::now(),
            inputs: serde_json::json!({
                "policy": policy.as_str(),
                "k": k,
                "candidate_runs": runs.len(),
            }),
            outputs: serde_json::json!({ "selected_run_ids": selected_ids }),
        },
    )
    .await?;

    tracing::info!(
        strategy_id,
        policy = policy.as_str(),
        selected = selected.len(),
        "meta selection recorded"
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn run(sleeve: &str, metrics: serde_json::Value) -> BacktestRunRow {
        BacktestRunRow {
            run_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, sleeve.as_bytes()),
            strategy_id: "S1".into(),
            sleeve_id: sleeve.into(),
            config_json: json!({}),
            start_date: "2025-01-01".parse::<NaiveDate>().unwrap(),
            end_date: "2025-03-01".parse::<NaiveDate>().unwrap(),
            metrics_json: metrics,
        }
    }

    fn buckets(q1: f64, q5: f64) -> serde_json::Value {
        json!({
            "q1": {"mean_return": q1, "days": 10},
            "q5": {"mean_return": q5, "days": 10},
        })
    }

    #[test]
    fn sharpe_policy_ranks_descending() {
        let runs = vec![
            run("a", json!({"sharpe": 0.5})),
            run("b", json!({"sharpe": 2.0})),
            run("c", json!({"sharpe": 1.0})),
        ];
        let ranked = rank_runs(&runs, SelectionPolicy::TopKSharpe);
        let order: Vec<&str> = ranked.iter().map(|r| r.sleeve_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn missing_metrics_sink_to_bottom() {
        let runs = vec![
            run("a", json!({})),
            run("b", json!({"sharpe": 0.1})),
        ];
        let ranked = rank_runs(&runs, SelectionPolicy::TopKSharpe);
        assert_eq!(ranked[0].sleeve_id, "b");
        assert_eq!(ranked[1].score, f64::NEG_INFINITY);
    }

    #[test]
    fn lambda_uplift_prefers_top_minus_bottom() {
        let runs = vec![
            run("flat", json!({"by_risk_quintile": buckets(0.01, 0.01)})),
            run("uplift", json!({"by_risk_quintile": buckets(-0.01, 0.03)})),
        ];
        let ranked = rank_runs(&runs, SelectionPolicy::TopKLambdaUplift);
        assert_eq!(ranked[0].sleeve_id, "uplift");
        assert!((ranked[0].score - 0.04).abs() < 1e-12);
    }

    #[test]
    fn lambda_robust_prefers_small_dispersion() {
        let runs = vec![
            run("wild", json!({"by_risk_quintile": buckets(-0.05, 0.05)})),
            run("steady", json!({"by_risk_quintile": buckets(0.009, 0.011)})),
        ];
        let ranked = rank_runs(&runs, SelectionPolicy::TopKLambdaRobust);
        assert_eq!(ranked[0].sleeve_id, "steady");
    }

    #[test]
    fn ties_break_lexicographically() {
        let runs = vec![
            run("zeta", json!({"sharpe": 1.0})),
            run("alpha", json!({"sharpe": 1.0})),
        ];
        let ranked = rank_runs(&runs, SelectionPolicy::TopKSharpe);
        assert_eq!(ranked[0].sleeve_id, "alpha");
    }
}
