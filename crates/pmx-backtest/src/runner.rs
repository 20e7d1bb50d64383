//! Store-backed sleeve runner: load history, reuse persisted engine outputs
//! where present, run the per-phase tasks inline per date, and feed the
//! target weights through the execution bridge with a `BacktestBroker`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use pmx_calendar::CalendarSpec;
use pmx_config::{ExecutionConfig, LoadedConfig};
use pmx_execution::{apply_execution_plan, BacktestBroker, ExecutionContext};
use pmx_schemas::{
    BacktestDailyEquityRow, BacktestRunRow, BacktestTradeRow, EngineDecisionRow, ExecutionMode,
    OrderSide,
};

use crate::engine::{closes_at, market_value, weights_for_date};
use crate::metrics::compute_metrics;
use crate::types::{BacktestInput, DailyRecord, FragilitySeries, SimTrade, SleeveConfig};

pub const ENGINE_NAME: &str = "BACKTEST_SLEEVE_RUNNER";

/// Run one sleeve over `[start_date, end_date]`, executing through the
/// bridge, and persist the `BacktestRun`, per-day equity, per-fill trades and
/// the runner's decision row.
pub async fn run_sleeve(
    pool: &PgPool,
    cfg: &SleeveConfig,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<BacktestRunRow> {
    let input = load_input(pool, cfg, start_date, end_date).await?;

    let config_value = serde_json::to_value(cfg).context("sleeve config serialization failed")?;
    let loaded = LoadedConfig::from_value(config_value.clone())?;

    // Deterministic run id from sleeve + range + config hash: re-running the
    // same experiment upserts the same row.
    let run_id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}|{}|{}|{}", cfg.sleeve_id, start_date, end_date, loaded.config_hash).as_bytes(),
    );

    let exec_cfg = ExecutionConfig {
        mode: "BACKTEST".to_string(),
        slippage_bps: cfg.slippage_bps,
        exec_risk_enabled: false,
        ..ExecutionConfig::default()
    };

    // Index bars per instrument for close lookups.
    let mut by_instrument: BTreeMap<String, Vec<&pmx_schemas::PriceBar>> = BTreeMap::new();
    for bar in &input.bars {
        by_instrument.entry(bar.instrument_id.clone()).or_default().push(bar);
    }
    for bars in by_instrument.values_mut() {
        bars.sort_by_key(|b| b.date);
    }

    let mut cash = cfg.initial_cash;
    let mut positions: BTreeMap<String, i64> = BTreeMap::new();
    let mut days: Vec<DailyRecord> = Vec::new();
    let mut trades: Vec<SimTrade> = Vec::new();
    let mut peak_equity = cfg.initial_cash;

    for date in input.calendar.trading_days_between(start_date, end_date) {
        let closes = closes_at(&by_instrument, date);
        if closes.is_empty() {
            continue;
        }

        let weights = weights_for_date(cfg, &input, date, &closes)
            .with_context(|| format!("sleeve pipeline failed on {date}"))?;

        let equity_before = cash + market_value(&positions, &closes);
        let ctx = ExecutionContext {
            portfolio_id: &cfg.portfolio_id,
            strategy_id: &cfg.strategy_id,
            as_of_date: date,
            mode: ExecutionMode::Backtest,
            equity: equity_before,
            prices: &closes,
            cfg: &exec_cfg,
        };

        let mut broker = BacktestBroker::new(closes.clone(), cfg.slippage_bps);
        let fills = apply_execution_plan(pool, &ctx, &weights, &mut broker)
            .await
            .with_context(|| format!("execution bridge failed on {date}"))?;

        for fill in &fills {
            let signed = match fill.side {
                OrderSide::Buy => fill.quantity,
                OrderSide::Sell => -fill.quantity,
            };
            cash -= signed as f64 * fill.price;
            let q = positions.entry(fill.instrument_id.clone()).or_insert(0);
            *q += signed;
            if *q == 0 {
                positions.remove(&fill.instrument_id);
            }
            trades.push(SimTrade {
                date,
                instrument_id: fill.instrument_id.clone(),
                quantity: signed,
                price: fill.price,
            });
        }

        let equity = cash + market_value(&positions, &closes);
        if equity > peak_equity {
            peak_equity = equity;
        }
        let drawdown = if peak_equity > 0.0 {
            (peak_equity - equity) / peak_equity
        } else {
            0.0
        };

        days.push(DailyRecord {
            date,
            equity,
            drawdown,
            regime_label: input
                .regimes
                .get(&date)
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            weights,
        });
    }

    if days.is_empty() {
        anyhow::bail!("no trading days with data in [{start_date}, {end_date}]");
    }

    let metrics = compute_metrics(cfg, &days, &trades, &input.fragility);

    let run_row = BacktestRunRow {
        run_id,
        strategy_id: cfg.strategy_id.clone(),
        sleeve_id: cfg.sleeve_id.clone(),
        config_json: config_value,
        start_date,
        end_date,
        metrics_json: metrics.clone(),
    };
    pmx_db::insert_backtest_run(pool, &run_row).await?;

    for day in &days {
        pmx_db::upsert_backtest_daily_equity(
            pool,
            &BacktestDailyEquityRow {
                run_id,
                date: day.date,
                equity: day.equity,
                drawdown: day.drawdown,
                exposures: serde_json::json!(day.weights),
            },
        )
        .await?;
    }
    for (i, trade) in trades.iter().enumerate() {
        pmx_db::insert_backtest_trade(
            pool,
            &BacktestTradeRow {
                run_id,
                trade_id: Uuid::new_v5(&run_id, format!("trade-{i}").as_bytes()),
                date: trade.date,
                instrument_id: trade.instrument_id.clone(),
                side: if trade.quantity >= 0 {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                quantity: trade.quantity.abs(),
                price: trade.price,
                decision_metadata: serde_json::json!({ "seq": i }),
            },
        )
        .await?;
    }

    pmx_db::insert_engine_decision(
        pool,
        &EngineDecisionRow {
            decision_id: Uuid::new_v5(&run_id, b"decision"),
            engine_name: ENGINE_NAME.to_string(),
            strategy_id: cfg.strategy_id.clone(),
            created_at: Utc::now(),
            inputs: serde_json::json!({
                "sleeve_id": cfg.sleeve_id,
                "start_date": start_date,
                "end_date": end_date,
                "config_hash": loaded.config_hash,
            }),
            outputs: metrics,
        },
    )
    .await?;

    tracing::info!(
        sleeve_id = cfg.sleeve_id,
        %run_id,
        days = days.len(),
        trades = trades.len(),
        "backtest run persisted"
    );
    Ok(run_row)
}

/// Assemble the engine input from the stores, reusing persisted regime and
/// fragility rows when they exist for the range.
async fn load_input(
    pool: &PgPool,
    cfg: &SleeveConfig,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<BacktestInput> {
    let calendar = pmx_db::fetch_market(pool, &cfg.market_id)
        .await?
        .and_then(|m| CalendarSpec::from_name(&m.calendar_spec))
        .unwrap_or_else(|| pmx_calendar::default_for_region(&cfg.region));

    let instruments = pmx_db::list_instruments(pool, &cfg.market_id, end_date).await?;
    let ids: Vec<String> = instruments.iter().map(|i| i.instrument_id.clone()).collect();

    // History needs warm-up for the assessment window.
    let warmup_start =
        start_date - chrono::Duration::days(cfg.assessment.horizon_days as i64 * 2 + 14);
    let bars = pmx_db::read_prices(pool, &ids, warmup_start, end_date).await?;
    let sectors = pmx_db::fetch_sectors(pool, &cfg.market_id).await?;

    // Reuse persisted regime states for the range.
    let mut regimes = BTreeMap::new();
    for day in calendar.trading_days_between(start_date, end_date) {
        if let Some(state) = pmx_db::read_regime_state(pool, &cfg.region, day).await? {
            regimes.insert(day, state.regime_label.as_str().to_string());
        }
    }

    // Reuse persisted fragility classifications.
    let mut fragility: BTreeMap<String, FragilitySeries> = BTreeMap::new();
    for id in &ids {
        let history = pmx_db::read_class_history(pool, id, end_date).await?;
        if history.is_empty() {
            continue;
        }
        let mut series = FragilitySeries::default();
        for row in history {
            let risk = pmx_db::read_state_change_risk(pool, id, row.as_of_date)
                .await?
                .map(|r| r.risk_score)
                .unwrap_or(0.0);
            series.points.push((row.as_of_date, row.class, risk));
        }
        fragility.insert(id.clone(), series);
    }

    Ok(BacktestInput {
        calendar,
        start_date,
        end_date,
        bars,
        sectors,
        fragility,
        regimes,
    })
}
