//! Persistence rim for the portfolio engine.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::PgPool;

use pmx_config::PortfolioConfig;
use pmx_schemas::{PortfolioRiskReportRow, TargetPortfolioRow};

use crate::scenario::{scenario_risk_metrics, ScenarioSet};
use crate::{build_weights, exposures_by_sector, target_row};

/// Build and persist the target portfolio for one date, plus the risk report
/// when scenario sets are supplied.
#[allow(clippy::too_many_arguments)]
pub async fn run_portfolio(
    pool: &PgPool,
    portfolio_id: &str,
    strategy_id: &str,
    market_id: &str,
    universe_id: &str,
    as_of_date: NaiveDate,
    cfg: &PortfolioConfig,
    scenario_sets: &[ScenarioSet],
) -> Result<TargetPortfolioRow> {
    let universe = pmx_db::read_universe(pool, universe_id, as_of_date)
        .await
        .context("portfolio universe read failed")?;
    let scores = pmx_db::read_scores_for_date(pool, strategy_id, market_id, as_of_date)
        .await
        .context("portfolio scores read failed")?;

    let weights = build_weights(&universe, &scores, cfg)?;
    let row = target_row(portfolio_id, as_of_date, &weights, cfg);
    pmx_db::upsert_target_portfolio(pool, &row).await?;

    if weights.is_empty() {
        tracing::info!(%portfolio_id, %as_of_date, "empty target portfolio (valid outcome)");
    }

    if !scenario_sets.is_empty() {
        let sectors = pmx_db::fetch_sectors(pool, market_id).await?;
        let report = PortfolioRiskReportRow {
            portfolio_id: portfolio_id.to_string(),
            as_of_date,
            risk_metrics: scenario_risk_metrics(&weights, scenario_sets),
            exposures_by_sector: serde_json::json!(exposures_by_sector(&weights, &sectors)),
            exposures_by_factor: serde_json::json!({}),
        };
        pmx_db::upsert_portfolio_risk_report(pool, &report).await?;
    }

    Ok(row)
}
