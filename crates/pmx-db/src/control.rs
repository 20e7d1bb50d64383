//! Control plane accessors: engine runs, engine decisions, backtest records.
//!
//! `engine_runs` is the only mutable control entity. Phase updates go through
//! `compare_and_set_phase` so every transition is guarded by the expected
//! current phase — lost updates under concurrent heartbeats become visible
//! as a `false` return instead of a silent overwrite.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pmx_schemas::{
    BacktestDailyEquityRow, BacktestRunRow, BacktestTradeRow, EngineDecisionRow, EnginePhase,
    EngineRunRow,
};

// ---------------------------------------------------------------------------
// Engine runs
// ---------------------------------------------------------------------------

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<EngineRunRow> {
    let phase: String = row.try_get("phase")?;
    Ok(EngineRunRow {
        run_id: row.try_get("run_id")?,
        as_of_date: row.try_get("as_of_date")?,
        region: row.try_get("region")?,
        phase: EnginePhase::parse(&phase)?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Upsert a run row in WAITING_FOR_DATA. Idempotent: an existing row for the
/// `(as_of_date, region)` key is returned untouched, whatever its phase.
pub async fn ensure_run(pool: &PgPool, as_of_date: NaiveDate, region: &str) -> Result<EngineRunRow> {
    sqlx::query(
        r#"
        insert into engine_runs (run_id, as_of_date, region, phase, attempts, updated_at)
        values ($1, $2, $3, 'WAITING_FOR_DATA', 0, now())
        on conflict (as_of_date, region) do nothing
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(as_of_date)
    .bind(region)
    .execute(pool)
    .await
    .context("ensure_run insert failed")?;

    fetch_run(pool, as_of_date, region)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ensure_run: row vanished after upsert"))
}

pub async fn fetch_run(
    pool: &PgPool,
    as_of_date: NaiveDate,
    region: &str,
) -> Result<Option<EngineRunRow>> {
    let row = sqlx::query(
        r#"
        select run_id, as_of_date, region, phase, attempts, last_error, updated_at
        from engine_runs
        where as_of_date = $1 and region = $2
        "#,
    )
    .bind(as_of_date)
    .bind(region)
    .fetch_optional(pool)
    .await
    .context("fetch_run failed")?;

    row.as_ref().map(run_from_row).transpose()
}

/// Guarded phase update: succeeds only if the row is still in
/// `expected_current`. Returns whether the update was applied.
pub async fn compare_and_set_phase(
    pool: &PgPool,
    as_of_date: NaiveDate,
    region: &str,
    expected_current: EnginePhase,
    next: EnginePhase,
    last_error: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update engine_runs
        set phase = $4,
            last_error = $5,
            updated_at = now()
        where as_of_date = $1 and region = $2 and phase = $3
        "#,
    )
    .bind(as_of_date)
    .bind(region)
    .bind(expected_current.as_str())
    .bind(next.as_str())
    .bind(last_error)
    .execute(pool)
    .await
    .context("compare_and_set_phase failed")?;

    Ok(res.rows_affected() == 1)
}

/// Increment the attempts counter (called once per dispatch).
pub async fn increment_attempts(pool: &PgPool, as_of_date: NaiveDate, region: &str) -> Result<()> {
    sqlx::query(
        r#"
        update engine_runs
        set attempts = attempts + 1,
            updated_at = now()
        where as_of_date = $1 and region = $2
        "#,
    )
    .bind(as_of_date)
    .bind(region)
    .execute(pool)
    .await
    .context("increment_attempts failed")?;
    Ok(())
}

/// Any row not in a terminal phase, oldest first.
pub async fn list_active_runs(pool: &PgPool) -> Result<Vec<EngineRunRow>> {
    let rows = sqlx::query(
        r#"
        select run_id, as_of_date, region, phase, attempts, last_error, updated_at
        from engine_runs
        where phase not in ('COMPLETED', 'FAILED')
        order by as_of_date asc, region asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_active_runs failed")?;

    rows.iter().map(run_from_row).collect()
}

// ---------------------------------------------------------------------------
// Engine decisions
// ---------------------------------------------------------------------------

pub async fn insert_engine_decision(pool: &PgPool, row: &EngineDecisionRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into engine_decisions (decision_id, engine_name, strategy_id, created_at, inputs, outputs)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (decision_id) do nothing
        "#,
    )
    .bind(row.decision_id)
    .bind(&row.engine_name)
    .bind(&row.strategy_id)
    .bind(row.created_at)
    .bind(&row.inputs)
    .bind(&row.outputs)
    .execute(pool)
    .await
    .context("insert_engine_decision failed")?;
    Ok(())
}

pub async fn read_decisions_for_engine(
    pool: &PgPool,
    engine_name: &str,
) -> Result<Vec<EngineDecisionRow>> {
    let rows = sqlx::query(
        r#"
        select decision_id, engine_name, strategy_id, created_at, inputs, outputs
        from engine_decisions
        where engine_name = $1
        order by created_at asc
        "#,
    )
    .bind(engine_name)
    .fetch_all(pool)
    .await
    .context("read_decisions_for_engine failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(EngineDecisionRow {
            decision_id: row.try_get("decision_id")?,
            engine_name: row.try_get("engine_name")?,
            strategy_id: row.try_get("strategy_id")?,
            created_at: row.try_get("created_at")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
        });
    }
    Ok(out)
}

/// Attach review metrics to a recorded decision.
pub async fn upsert_decision_outcome(
    pool: &PgPool,
    row: &pmx_schemas::DecisionOutcomeRow,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into decision_outcomes (decision_id, metrics, reviewed_at)
        values ($1, $2, $3)
        on conflict (decision_id) do update
            set metrics = excluded.metrics,
                reviewed_at = excluded.reviewed_at
        "#,
    )
    .bind(row.decision_id)
    .bind(&row.metrics)
    .bind(row.reviewed_at)
    .execute(pool)
    .await
    .context("upsert_decision_outcome failed")?;
    Ok(())
}

pub async fn read_decision_outcome(
    pool: &PgPool,
    decision_id: Uuid,
) -> Result<Option<pmx_schemas::DecisionOutcomeRow>> {
    let row = sqlx::query(
        r#"
        select decision_id, metrics, reviewed_at
        from decision_outcomes
        where decision_id = $1
        "#,
    )
    .bind(decision_id)
    .fetch_optional(pool)
    .await
    .context("read_decision_outcome failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(pmx_schemas::DecisionOutcomeRow {
        decision_id: row.try_get("decision_id")?,
        metrics: row.try_get("metrics")?,
        reviewed_at: row.try_get("reviewed_at")?,
    }))
}

// ---------------------------------------------------------------------------
// Backtest records
// ---------------------------------------------------------------------------

pub async fn insert_backtest_run(pool: &PgPool, row: &BacktestRunRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into backtest_runs
            (run_id, strategy_id, sleeve_id, config_json, start_date, end_date, metrics_json)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (run_id) do update
            set metrics_json = excluded.metrics_json
        "#,
    )
    .bind(row.run_id)
    .bind(&row.strategy_id)
    .bind(&row.sleeve_id)
    .bind(&row.config_json)
    .bind(row.start_date)
    .bind(row.end_date)
    .bind(&row.metrics_json)
    .execute(pool)
    .await
    .context("insert_backtest_run failed")?;
    Ok(())
}

pub async fn read_backtest_runs(
    pool: &PgPool,
    strategy_id: &str,
) -> Result<Vec<BacktestRunRow>> {
    let rows = sqlx::query(
        r#"
        select run_id, strategy_id, sleeve_id, config_json, start_date, end_date, metrics_json
        from backtest_runs
        where strategy_id = $1
        order by sleeve_id asc, run_id asc
        "#,
    )
    .bind(strategy_id)
    .fetch_all(pool)
    .await
    .context("read_backtest_runs failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(BacktestRunRow {
            run_id: row.try_get("run_id")?,
            strategy_id: row.try_get("strategy_id")?,
            sleeve_id: row.try_get("sleeve_id")?,
            config_json: row.try_get("config_json")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            metrics_json: row.try_get("metrics_json")?,
        });
    }
    Ok(out)
}

pub async fn upsert_backtest_daily_equity(
    pool: &PgPool,
    row: &BacktestDailyEquityRow,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into backtest_daily_equity (run_id, date, equity, drawdown, exposures)
        values ($1, $2, $3, $4, $5)
        on conflict (run_id, date) do update
            set equity = excluded.equity,
                drawdown = excluded.drawdown,
                exposures = excluded.exposures
        "#,
    )
    .bind(row.run_id)
    .bind(row.date)
    .bind(row.equity)
    .bind(row.drawdown)
    .bind(&row.exposures)
    .execute(pool)
    .await
    .context("upsert_backtest_daily_equity failed")?;
    Ok(())
}

pub async fn insert_backtest_trade(pool: &PgPool, row: &BacktestTradeRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into backtest_trades
            (run_id, trade_id, date, instrument_id, side, quantity, price, decision_metadata)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (run_id, trade_id) do nothing
        "#,
    )
    .bind(row.run_id)
    .bind(row.trade_id)
    .bind(row.date)
    .bind(&row.instrument_id)
    .bind(row.side.as_str())
    .bind(row.quantity)
    .bind(row.price)
    .bind(&row.decision_metadata)
    .execute(pool)
    .await
    .context("insert_backtest_trade failed")?;
    Ok(())
}

