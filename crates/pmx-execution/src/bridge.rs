//! The execution bridge: plan → guard → submit → settle → snapshot.
//!
//! Re-running the bridge for the same `(portfolio, date, mode)` with
//! unchanged targets is a no-op: order ids are deterministic, fills dedupe on
//! fill id, and snapshots upsert.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use sqlx::PgPool;
use uuid::Uuid;

use pmx_config::ExecutionConfig;
use pmx_schemas::{
    ExecutionMode, FillRow, OrderRow, OrderSide, OrderStatus, OrderType, PositionSnapshotRow,
    RiskActionRow, RiskActionType,
};

use crate::broker::{order_timestamp, Broker, BrokerError};
use crate::plan::plan_orders;
use crate::risk_guard::SoftwareRiskGuard;

/// Everything the bridge needs for one date beyond the broker itself.
pub struct ExecutionContext<'a> {
    pub portfolio_id: &'a str,
    pub strategy_id: &'a str,
    pub as_of_date: NaiveDate,
    pub mode: ExecutionMode,
    /// Book equity in base currency (sizing denominator).
    pub equity: f64,
    /// Valuation prices for the date (usually closes).
    pub prices: &'a BTreeMap<String, f64>,
    pub cfg: &'a ExecutionConfig,
}

/// Apply one day's execution plan through the given broker.
///
/// Steps:
/// 1. read prior positions (latest snapshots at or before `d − 1`),
/// 2. plan signed deltas against the target weights,
/// 3. per order: persist PENDING → software risk guard → submit (bounded
///    retry on transient errors) → SUBMITTED or REJECTED,
/// 4. settle fills (BACKTEST: `process_fills`; PAPER/LIVE: `poll_fills`),
/// 5. persist one snapshot per non-zero resulting position.
pub async fn apply_execution_plan(
    pool: &PgPool,
    ctx: &ExecutionContext<'_>,
    weights: &BTreeMap<String, f64>,
    broker: &mut dyn Broker,
) -> Result<Vec<FillRow>> {
    // 1. Prior positions: cross-date carry goes through persistence only.
    let prior_date = ctx.as_of_date - Duration::days(1);
    let prior =
        pmx_db::read_latest_position_snapshots(pool, ctx.portfolio_id, prior_date, ctx.mode)
            .await
            .context("prior position read failed")?;
    let mut positions: BTreeMap<String, i64> = prior
        .iter()
        .filter(|p| p.quantity != 0)
        .map(|p| (p.instrument_id.clone(), p.quantity))
        .collect();
    let mut avg_costs: BTreeMap<String, f64> = prior
        .iter()
        .map(|p| (p.instrument_id.clone(), p.avg_cost))
        .collect();

    // 2. Plan. An empty target book is "no view", not "liquidate": it plans
    // zero orders and the prior positions roll forward unchanged.
    let planned = if weights.is_empty() {
        Vec::new()
    } else {
        plan_orders(
            ctx.portfolio_id,
            ctx.as_of_date,
            ctx.mode,
            ctx.equity,
            weights,
            ctx.prices,
            &positions,
        )?
    };

    // 3. Submit loop.
    let guard = SoftwareRiskGuard::new(ctx.cfg, ctx.prices, &positions, ctx.equity);
    let ts = order_timestamp(ctx.as_of_date);
    let mut submitted: Vec<Uuid> = Vec::new();

    for p in &planned {
        let order = OrderRow {
            order_id: p.order_id,
            portfolio_id: ctx.portfolio_id.to_string(),
            instrument_id: p.instrument_id.clone(),
            side: p.side,
            order_type: OrderType::Market,
            quantity: p.quantity,
            status: OrderStatus::Pending,
            mode: ctx.mode,
            timestamp: ts,
            broker_ref: None,
        };

        // Idempotent persistence before any broker call.
        let existing = pmx_db::fetch_order(pool, p.order_id).await?;
        if let Some(existing) = &existing {
            if existing.status.is_terminal() {
                continue;
            }
        }
        if existing.is_none() {
            pmx_db::upsert_order(pool, &order).await?;
        }

        if ctx.cfg.exec_risk_enabled {
            if let Err(breach) = guard.check(p) {
                tracing::warn!(%breach, "execution risk reject");
                pmx_db::insert_risk_action(
                    pool,
                    &RiskActionRow {
                        strategy_id: ctx.strategy_id.to_string(),
                        instrument_id: p.instrument_id.clone(),
                        decision_id: None,
                        action_type: RiskActionType::ExecutionReject,
                        original_weight: weights.get(&p.instrument_id).copied().unwrap_or(0.0),
                        adjusted_weight: 0.0,
                        reason: breach.to_string(),
                        created_at: ts,
                    },
                )
                .await?;
                pmx_db::advance_order_status(pool, p.order_id, OrderStatus::Rejected, None)
                    .await?;
                continue;
            }
        }

        match submit_with_retry(broker, &order, ctx.cfg.broker_max_retries).await {
            Ok(broker_ref) => {
                pmx_db::advance_order_status(
                    pool,
                    p.order_id,
                    OrderStatus::Submitted,
                    Some(&broker_ref),
                )
                .await?;
                submitted.push(p.order_id);
            }
            Err(e) => {
                // Retries exhausted or hard reject: mark REJECTED, run on.
                tracing::warn!(order_id = %p.order_id, error = %e, "order rejected");
                pmx_db::advance_order_status(pool, p.order_id, OrderStatus::Rejected, None)
                    .await?;
            }
        }
    }

    // 4. Settle.
    let fills = match ctx.mode {
        ExecutionMode::Backtest => broker
            .process_fills(ctx.as_of_date)
            .map_err(|e| anyhow::anyhow!("process_fills failed: {e}"))?,
        ExecutionMode::Paper | ExecutionMode::Live => broker
            .poll_fills(ts)
            .map_err(|e| anyhow::anyhow!("poll_fills failed: {e}"))?,
    };

    let mut applied = Vec::with_capacity(fills.len());
    for fill in fills {
        if fill.quantity <= 0 {
            anyhow::bail!("broker produced non-positive fill quantity {}", fill.quantity);
        }
        let inserted = pmx_db::insert_fill_deduped(pool, &fill).await?;
        if !inserted {
            continue; // Replay: already persisted.
        }
        advance_for_fill(pool, &fill).await?;
        applied.push(fill);
    }

    // Rebuild the book from prior positions plus every persisted fill for the
    // date. Replays contribute their previously-persisted fills here, so a
    // re-run reproduces identical snapshots instead of regressing to d − 1.
    for order in pmx_db::list_orders_for_date(pool, ctx.portfolio_id, ctx.as_of_date, ctx.mode)
        .await?
    {
        for fill in pmx_db::read_fills_for_order(pool, order.order_id).await? {
            apply_fill_to_book(&mut positions, &mut avg_costs, &fill);
        }
    }

    // 5. Snapshot non-zero positions.
    for (instrument_id, qty) in &positions {
        if *qty == 0 {
            continue;
        }
        let price = ctx.prices.get(instrument_id).copied().unwrap_or(0.0);
        let avg_cost = avg_costs.get(instrument_id).copied().unwrap_or(price);
        pmx_db::upsert_position_snapshot(
            pool,
            &PositionSnapshotRow {
                portfolio_id: ctx.portfolio_id.to_string(),
                instrument_id: instrument_id.clone(),
                as_of_date: ctx.as_of_date,
                quantity: *qty,
                avg_cost,
                market_value: *qty as f64 * price,
                unrealized_pnl: *qty as f64 * (price - avg_cost),
                mode: ctx.mode,
            },
        )
        .await?;
    }

    tracing::info!(
        portfolio_id = ctx.portfolio_id,
        as_of_date = %ctx.as_of_date,
        planned = planned.len(),
        submitted = submitted.len(),
        fills = applied.len(),
        "execution plan applied"
    );
    Ok(applied)
}

/// Submit with bounded backoff on transient errors only.
async fn submit_with_retry(
    broker: &mut dyn Broker,
    order: &OrderRow,
    max_retries: u32,
) -> Result<String, BrokerError> {
    let mut attempt = 0u32;
    loop {
        match broker.submit(order) {
            Ok(r) => return Ok(r),
            Err(BrokerError::Transient { detail }) if attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
                tracing::debug!(order_id = %order.order_id, attempt, detail, "retrying submit");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Update the in-memory book (quantities + average costs) for one fill.
fn apply_fill_to_book(
    positions: &mut BTreeMap<String, i64>,
    avg_costs: &mut BTreeMap<String, f64>,
    fill: &FillRow,
) {
    let qty = positions.entry(fill.instrument_id.clone()).or_insert(0);
    let signed = match fill.side {
        OrderSide::Buy => fill.quantity,
        OrderSide::Sell => -fill.quantity,
    };

    let old_qty = *qty;
    let new_qty = old_qty + signed;

    // Average cost: increases in exposure blend in the fill price; reductions
    // keep the prior average; flips reset to the fill price.
    let increases = (old_qty >= 0 && signed > 0) || (old_qty <= 0 && signed < 0);
    if increases {
        let old_cost = avg_costs.get(&fill.instrument_id).copied().unwrap_or(0.0);
        let blended = (old_qty.abs() as f64 * old_cost + fill.quantity as f64 * fill.price)
            / (old_qty.abs() + fill.quantity).max(1) as f64;
        avg_costs.insert(fill.instrument_id.clone(), blended);
    } else if old_qty.signum() != new_qty.signum() && new_qty != 0 {
        avg_costs.insert(fill.instrument_id.clone(), fill.price);
    }

    *qty = new_qty;
    if new_qty == 0 {
        positions.remove(&fill.instrument_id);
    }
}

/// Advance the order's status from its cumulative filled quantity.
async fn advance_for_fill(pool: &PgPool, fill: &FillRow) -> Result<()> {
    let order = pmx_db::fetch_order(pool, fill.order_id)
        .await?
        .context("fill references unknown order")?;
    let filled = pmx_db::filled_quantity(pool, fill.order_id).await?;

    if filled > order.quantity {
        anyhow::bail!(
            "fills {} exceed order quantity {} for {}",
            filled,
            order.quantity,
            order.order_id
        );
    }

    let next = if filled == order.quantity {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
    pmx_db::advance_order_status(pool, fill.order_id, next, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmx_schemas::ExecutionMode;

    fn fill(side: OrderSide, qty: i64, price: f64) -> FillRow {
        FillRow {
            fill_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            instrument_id: "A".into(),
            side,
            quantity: qty,
            price,
            timestamp: order_timestamp("2025-03-10".parse().unwrap()),
            mode: ExecutionMode::Backtest,
        }
    }

    #[test]
    fn buys_blend_average_cost() {
        let mut positions = BTreeMap::new();
        let mut costs = BTreeMap::new();
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Buy, 100, 10.0));
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Buy, 100, 20.0));
        assert_eq!(positions["A"], 200);
        assert!((costs["A"] - 15.0).abs() < 1e-12);
    }

    #[test]
    fn sells_keep_average_cost_and_flat_removes() {
        let mut positions = BTreeMap::new();
        let mut costs = BTreeMap::new();
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Buy, 100, 10.0));
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Sell, 40, 12.0));
        assert_eq!(positions["A"], 60);
        assert!((costs["A"] - 10.0).abs() < 1e-12);

        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Sell, 60, 12.0));
        assert!(!positions.contains_key("A"));
    }

    #[test]
    fn flip_resets_cost_basis() {
        let mut positions = BTreeMap::new();
        let mut costs = BTreeMap::new();
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Buy, 50, 10.0));
        apply_fill_to_book(&mut positions, &mut costs, &fill(OrderSide::Sell, 80, 14.0));
        assert_eq!(positions["A"], -30);
        assert!((costs["A"] - 14.0).abs() < 1e-12);
    }
}
