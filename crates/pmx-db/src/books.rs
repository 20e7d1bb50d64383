//! Runtime store accessors for the books group: universes, target
//! portfolios, risk reports, risk actions.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};

use pmx_schemas::{
    PortfolioRiskReportRow, RiskActionRow, RiskActionType, TargetPortfolioRow, UniverseMemberRow,
};

// ---------------------------------------------------------------------------
// Universe members
// ---------------------------------------------------------------------------

pub async fn upsert_universe_member(pool: &PgPool, row: &UniverseMemberRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into universe_members
            (universe_id, instrument_id, as_of_date, in_universe, rank, scores, reasons)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (universe_id, instrument_id, as_of_date) do update
            set in_universe = excluded.in_universe,
                rank = excluded.rank,
                scores = excluded.scores,
                reasons = excluded.reasons
        "#,
    )
    .bind(&row.universe_id)
    .bind(&row.instrument_id)
    .bind(row.as_of_date)
    .bind(row.in_universe)
    .bind(row.rank)
    .bind(&row.scores)
    .bind(&row.reasons)
    .execute(pool)
    .await
    .context("upsert_universe_member failed")?;
    Ok(())
}

/// Batch upsert grouped by natural key; one statement per row, no cross-row
/// transaction (single-row transactionality is the contract).
pub async fn upsert_universe_members(pool: &PgPool, rows: &[UniverseMemberRow]) -> Result<()> {
    for row in rows {
        upsert_universe_member(pool, row).await?;
    }
    Ok(())
}

pub async fn read_universe(
    pool: &PgPool,
    universe_id: &str,
    as_of_date: NaiveDate,
) -> Result<Vec<UniverseMemberRow>> {
    let rows = sqlx::query(
        r#"
        select universe_id, instrument_id, as_of_date, in_universe, rank, scores, reasons
        from universe_members
        where universe_id = $1 and as_of_date = $2
        order by rank asc, instrument_id asc
        "#,
    )
    .bind(universe_id)
    .bind(as_of_date)
    .fetch_all(pool)
    .await
    .context("read_universe failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(UniverseMemberRow {
            universe_id: row.try_get("universe_id")?,
            instrument_id: row.try_get("instrument_id")?,
            as_of_date: row.try_get("as_of_date")?,
            in_universe: row.try_get("in_universe")?,
            rank: row.try_get("rank")?,
            scores: row.try_get("scores")?,
            reasons: row.try_get("reasons")?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Target portfolios & risk reports
// ---------------------------------------------------------------------------

pub async fn upsert_target_portfolio(pool: &PgPool, row: &TargetPortfolioRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into target_portfolios (portfolio_id, as_of_date, target_positions, metadata)
        values ($1, $2, $3, $4)
        on conflict (portfolio_id, as_of_date) do update
            set target_positions = excluded.target_positions,
                metadata = excluded.metadata
        "#,
    )
    .bind(&row.portfolio_id)
    .bind(row.as_of_date)
    .bind(&row.target_positions)
    .bind(&row.metadata)
    .execute(pool)
    .await
    .context("upsert_target_portfolio failed")?;
    Ok(())
}

pub async fn read_target_portfolio(
    pool: &PgPool,
    portfolio_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<TargetPortfolioRow>> {
    let row = sqlx::query(
        r#"
        select portfolio_id, as_of_date, target_positions, metadata
        from target_portfolios
        where portfolio_id = $1 and as_of_date = $2
        "#,
    )
    .bind(portfolio_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_target_portfolio failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(TargetPortfolioRow {
        portfolio_id: row.try_get("portfolio_id")?,
        as_of_date: row.try_get("as_of_date")?,
        target_positions: row.try_get("target_positions")?,
        metadata: row.try_get("metadata")?,
    }))
}

pub async fn upsert_portfolio_risk_report(
    pool: &PgPool,
    row: &PortfolioRiskReportRow,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into portfolio_risk_reports
            (portfolio_id, as_of_date, risk_metrics, exposures_by_sector, exposures_by_factor)
        values ($1, $2, $3, $4, $5)
        on conflict (portfolio_id, as_of_date) do update
            set risk_metrics = excluded.risk_metrics,
                exposures_by_sector = excluded.exposures_by_sector,
                exposures_by_factor = excluded.exposures_by_factor
        "#,
    )
    .bind(&row.portfolio_id)
    .bind(row.as_of_date)
    .bind(&row.risk_metrics)
    .bind(&row.exposures_by_sector)
    .bind(&row.exposures_by_factor)
    .execute(pool)
    .await
    .context("upsert_portfolio_risk_report failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Risk actions (append-only log)
// ---------------------------------------------------------------------------

pub async fn insert_risk_action(pool: &PgPool, row: &RiskActionRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into risk_actions
            (strategy_id, instrument_id, decision_id, action_type,
             original_weight, adjusted_weight, reason, created_at)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&row.strategy_id)
    .bind(&row.instrument_id)
    .bind(row.decision_id)
    .bind(row.action_type.as_str())
    .bind(row.original_weight)
    .bind(row.adjusted_weight)
    .bind(&row.reason)
    .bind(row.created_at)
    .execute(pool)
    .await
    .context("insert_risk_action failed")?;
    Ok(())
}

pub async fn insert_risk_actions(pool: &PgPool, rows: &[RiskActionRow]) -> Result<()> {
    for row in rows {
        insert_risk_action(pool, row).await?;
    }
    Ok(())
}

pub async fn read_risk_actions(
    pool: &PgPool,
    strategy_id: &str,
) -> Result<Vec<RiskActionRow>> {
    let rows = sqlx::query(
        r#"
        select strategy_id, instrument_id, decision_id, action_type,
               original_weight, adjusted_weight, reason, created_at
        from risk_actions
        where strategy_id = $1
        order by action_id asc
        "#,
    )
    .bind(strategy_id)
    .fetch_all(pool)
    .await
    .context("read_risk_actions failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let action: String = row.try_get("action_type")?;
        out.push(RiskActionRow {
            strategy_id: row.try_get("strategy_id")?,
            instrument_id: row.try_get("instrument_id")?,
            decision_id: row.try_get("decision_id")?,
            action_type: RiskActionType::parse(&action)?,
            original_weight: row.try_get("original_weight")?,
            adjusted_weight: row.try_get("adjusted_weight")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}
