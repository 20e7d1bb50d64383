//! Runtime store accessors for execution: orders, fills, position snapshots.
//!
//! Idempotency contract: BACKTEST orders carry deterministic UUIDv5 ids, so
//! re-running a date re-upserts the same rows instead of duplicating them.
//! Fills dedupe on fill_id with `on conflict do nothing`.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pmx_schemas::{ExecutionMode, FillRow, OrderRow, OrderSide, OrderStatus, OrderType,
    PositionSnapshotRow};

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

pub async fn upsert_order(pool: &PgPool, row: &OrderRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into orders
            (order_id, portfolio_id, instrument_id, side, order_type,
             quantity, status, mode, ts, broker_ref)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (order_id) do update
            set status = excluded.status,
                broker_ref = excluded.broker_ref
        "#,
    )
    .bind(row.order_id)
    .bind(&row.portfolio_id)
    .bind(&row.instrument_id)
    .bind(row.side.as_str())
    .bind(row.order_type.as_str())
    .bind(row.quantity)
    .bind(row.status.as_str())
    .bind(row.mode.as_str())
    .bind(row.timestamp)
    .bind(&row.broker_ref)
    .execute(pool)
    .await
    .context("upsert_order failed")?;
    Ok(())
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<OrderRow> {
    let side: String = row.try_get("side")?;
    let otype: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;
    Ok(OrderRow {
        order_id: row.try_get("order_id")?,
        portfolio_id: row.try_get("portfolio_id")?,
        instrument_id: row.try_get("instrument_id")?,
        side: OrderSide::parse(&side)?,
        order_type: OrderType::parse(&otype)?,
        quantity: row.try_get("quantity")?,
        status: OrderStatus::parse(&status)?,
        mode: ExecutionMode::parse(&mode)?,
        timestamp: row.try_get("ts")?,
        broker_ref: row.try_get("broker_ref")?,
    })
}

pub async fn fetch_order(pool: &PgPool, order_id: Uuid) -> Result<Option<OrderRow>> {
    let row = sqlx::query(
        r#"
        select order_id, portfolio_id, instrument_id, side, order_type,
               quantity, status, mode, ts, broker_ref
        from orders
        where order_id = $1
        "#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await
    .context("fetch_order failed")?;

    row.as_ref().map(order_from_row).transpose()
}

/// Advance an order's status monotonically. A regression (e.g. FILLED →
/// SUBMITTED) is a contract violation and errors instead of writing.
pub async fn advance_order_status(
    pool: &PgPool,
    order_id: Uuid,
    next: OrderStatus,
    broker_ref: Option<&str>,
) -> Result<()> {
    let current = fetch_order(pool, order_id)
        .await?
        .ok_or_else(|| anyhow!("advance_order_status: unknown order {order_id}"))?;

    if current.status == next {
        return Ok(());
    }
    if !current.status.can_advance_to(next) {
        return Err(anyhow!(
            "order status regression: {} -> {} for {}",
            current.status.as_str(),
            next.as_str(),
            order_id
        ));
    }

    sqlx::query(
        r#"
        update orders
        set status = $2,
            broker_ref = coalesce($3, broker_ref)
        where order_id = $1
        "#,
    )
    .bind(order_id)
    .bind(next.as_str())
    .bind(broker_ref)
    .execute(pool)
    .await
    .context("advance_order_status update failed")?;
    Ok(())
}

pub async fn list_orders_for_date(
    pool: &PgPool,
    portfolio_id: &str,
    date: NaiveDate,
    mode: ExecutionMode,
) -> Result<Vec<OrderRow>> {
    let rows = sqlx::query(
        r#"
        select order_id, portfolio_id, instrument_id, side, order_type,
               quantity, status, mode, ts, broker_ref
        from orders
        where portfolio_id = $1
          and mode = $2
          and ts >= $3::date
          and ts < ($3::date + interval '1 day')
        order by instrument_id asc, order_id asc
        "#,
    )
    .bind(portfolio_id)
    .bind(mode.as_str())
    .bind(date)
    .fetch_all(pool)
    .await
    .context("list_orders_for_date failed")?;

    rows.iter().map(order_from_row).collect()
}

// ---------------------------------------------------------------------------
// Fills
// ---------------------------------------------------------------------------

/// Insert a fill, deduping on fill_id. Returns true if the row was new.
pub async fn insert_fill_deduped(pool: &PgPool, row: &FillRow) -> Result<bool> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into fills (fill_id, order_id, instrument_id, side, quantity, price, ts, mode)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (fill_id) do nothing
        returning fill_id
        "#,
    )
    .bind(row.fill_id)
    .bind(row.order_id)
    .bind(&row.instrument_id)
    .bind(row.side.as_str())
    .bind(row.quantity)
    .bind(row.price)
    .bind(row.timestamp)
    .bind(row.mode.as_str())
    .fetch_optional(pool)
    .await
    .context("insert_fill_deduped failed")?;

    Ok(inserted.is_some())
}

pub async fn read_fills_for_order(pool: &PgPool, order_id: Uuid) -> Result<Vec<FillRow>> {
    let rows = sqlx::query(
        r#"
        select fill_id, order_id, instrument_id, side, quantity, price, ts, mode
        from fills
        where order_id = $1
        order by ts asc, fill_id asc
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("read_fills_for_order failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let side: String = row.try_get("side")?;
        let mode: String = row.try_get("mode")?;
        out.push(FillRow {
            fill_id: row.try_get("fill_id")?,
            order_id: row.try_get("order_id")?,
            instrument_id: row.try_get("instrument_id")?,
            side: OrderSide::parse(&side)?,
            quantity: row.try_get("quantity")?,
            price: row.try_get("price")?,
            timestamp: row.try_get("ts")?,
            mode: ExecutionMode::parse(&mode)?,
        });
    }
    Ok(out)
}

/// Sum of filled quantity for an order (0 when no fills).
pub async fn filled_quantity(pool: &PgPool, order_id: Uuid) -> Result<i64> {
    let (qty,): (i64,) = sqlx::query_as(
        r#"
        select coalesce(sum(quantity), 0)::bigint
        from fills
        where order_id = $1
        "#,
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
    .context("filled_quantity failed")?;
    Ok(qty)
}

// ---------------------------------------------------------------------------
// Position snapshots
// ---------------------------------------------------------------------------

pub async fn upsert_position_snapshot(pool: &PgPool, row: &PositionSnapshotRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into position_snapshots
            (portfolio_id, instrument_id, as_of_date, mode,
             quantity, avg_cost, market_value, unrealized_pnl)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (portfolio_id, instrument_id, as_of_date, mode) do update
            set quantity = excluded.quantity,
                avg_cost = excluded.avg_cost,
                market_value = excluded.market_value,
                unrealized_pnl = excluded.unrealized_pnl
        "#,
    )
    .bind(&row.portfolio_id)
    .bind(&row.instrument_id)
    .bind(row.as_of_date)
    .bind(row.mode.as_str())
    .bind(row.quantity)
    .bind(row.avg_cost)
    .bind(row.market_value)
    .bind(row.unrealized_pnl)
    .execute(pool)
    .await
    .context("upsert_position_snapshot failed")?;
    Ok(())
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<PositionSnapshotRow> {
    let mode: String = row.try_get("mode")?;
    Ok(PositionSnapshotRow {
        portfolio_id: row.try_get("portfolio_id")?,
        instrument_id: row.try_get("instrument_id")?,
        as_of_date: row.try_get("as_of_date")?,
        mode: ExecutionMode::parse(&mode)?,
        quantity: row.try_get("quantity")?,
        avg_cost: row.try_get("avg_cost")?,
        market_value: row.try_get("market_value")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
    })
}

pub async fn read_position_snapshots(
    pool: &PgPool,
    portfolio_id: &str,
    as_of_date: NaiveDate,
    mode: ExecutionMode,
) -> Result<Vec<PositionSnapshotRow>> {
    let rows = sqlx::query(
        r#"
        select portfolio_id, instrument_id, as_of_date, mode,
               quantity, avg_cost, market_value, unrealized_pnl
        from position_snapshots
        where portfolio_id = $1 and as_of_date = $2 and mode = $3
        order by instrument_id asc
        "#,
    )
    .bind(portfolio_id)
    .bind(as_of_date)
    .bind(mode.as_str())
    .fetch_all(pool)
    .await
    .context("read_position_snapshots failed")?;

    rows.iter().map(snapshot_from_row).collect()
}

/// Most recent snapshot set with `as_of_date <= date`. This is the only
/// cross-date carry in the pipeline (the execution bridge's prior positions).
pub async fn read_latest_position_snapshots(
    pool: &PgPool,
    portfolio_id: &str,
    date: NaiveDate,
    mode: ExecutionMode,
) -> Result<Vec<PositionSnapshotRow>> {
    let (latest,): (Option<NaiveDate>,) = sqlx::query_as(
        r#"
        select max(as_of_date)
        from position_snapshots
        where portfolio_id = $1 and as_of_date <= $2 and mode = $3
        "#,
    )
    .bind(portfolio_id)
    .bind(date)
    .bind(mode.as_str())
    .fetch_one(pool)
    .await
    .context("read_latest_position_snapshots max query failed")?;

    let Some(latest_date) = latest else {
        return Ok(Vec::new());
    };

    read_position_snapshots(pool, portfolio_id, latest_date, mode).await
}
