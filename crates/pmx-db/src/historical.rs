//! Historical store accessors: instruments, daily prices, embeddings.
//!
//! Append-only semantics: prices and reference rows are upserted by ingest,
//! embeddings are write-once per natural key (re-upserts must carry identical
//! vectors for a fixed model_id; the layer does not re-verify, encoders do).

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};

use pmx_schemas::{
    InstrumentRow, JointEmbeddingRow, MarketRow, NumericWindowEmbeddingRow, PriceBar,
    TextEmbeddingRow,
};

use crate::{decode_vector, encode_vector};

// ---------------------------------------------------------------------------
// Markets & instruments
// ---------------------------------------------------------------------------

pub async fn upsert_market(pool: &PgPool, row: &MarketRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into md_markets (market_id, region, calendar_spec)
        values ($1, $2, $3)
        on conflict (market_id) do update
            set region = excluded.region,
                calendar_spec = excluded.calendar_spec
        "#,
    )
    .bind(&row.market_id)
    .bind(&row.region)
    .bind(&row.calendar_spec)
    .execute(pool)
    .await
    .context("upsert_market failed")?;
    Ok(())
}

pub async fn fetch_market(pool: &PgPool, market_id: &str) -> Result<Option<MarketRow>> {
    let row = sqlx::query(
        r#"
        select market_id, region, calendar_spec
        from md_markets
        where market_id = $1
        "#,
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await
    .context("fetch_market failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(MarketRow {
        market_id: row.try_get("market_id")?,
        region: row.try_get("region")?,
        calendar_spec: row.try_get("calendar_spec")?,
    }))
}

pub async fn upsert_instrument(pool: &PgPool, row: &InstrumentRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into md_instruments (instrument_id, market_id, issuer_id, currency, status)
        values ($1, $2, $3, $4, $5)
        on conflict (instrument_id) do update
            set market_id = excluded.market_id,
                issuer_id = excluded.issuer_id,
                currency  = excluded.currency,
                status    = excluded.status
        "#,
    )
    .bind(&row.instrument_id)
    .bind(&row.market_id)
    .bind(&row.issuer_id)
    .bind(&row.currency)
    .bind(&row.status)
    .execute(pool)
    .await
    .context("upsert_instrument failed")?;
    Ok(())
}

/// Instruments in a market that are ACTIVE. `active_on` is accepted for
/// interface stability; status history is not modeled, so the flag filter is
/// the whole check.
pub async fn list_instruments(
    pool: &PgPool,
    market_id: &str,
    _active_on: NaiveDate,
) -> Result<Vec<InstrumentRow>> {
    let rows = sqlx::query(
        r#"
        select instrument_id, market_id, issuer_id, currency, status
        from md_instruments
        where market_id = $1
          and status = 'ACTIVE'
        order by instrument_id asc
        "#,
    )
    .bind(market_id)
    .fetch_all(pool)
    .await
    .context("list_instruments failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(InstrumentRow {
            instrument_id: row.try_get("instrument_id")?,
            market_id: row.try_get("market_id")?,
            issuer_id: row.try_get("issuer_id")?,
            currency: row.try_get("currency")?,
            status: row.try_get("status")?,
        });
    }
    Ok(out)
}

/// Sector lookup for universe sector caps: instrument_id → issuer sector.
pub async fn fetch_sectors(
    pool: &PgPool,
    market_id: &str,
) -> Result<std::collections::BTreeMap<String, String>> {
    let rows = sqlx::query(
        r#"
        select i.instrument_id, coalesce(s.sector, '') as sector
        from md_instruments i
        left join md_issuers s on s.issuer_id = i.issuer_id
        where i.market_id = $1
        "#,
    )
    .bind(market_id)
    .fetch_all(pool)
    .await
    .context("fetch_sectors failed")?;

    let mut out = std::collections::BTreeMap::new();
    for row in rows {
        out.insert(row.try_get("instrument_id")?, row.try_get("sector")?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

pub async fn upsert_price_bar(pool: &PgPool, bar: &PriceBar) -> Result<()> {
    sqlx::query(
        r#"
        insert into md_price_daily
            (instrument_id, date, open, high, low, close, adj_close, volume)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (instrument_id, date) do update
            set open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                adj_close = excluded.adj_close,
                volume = excluded.volume
        "#,
    )
    .bind(&bar.instrument_id)
    .bind(bar.date)
    .bind(bar.open)
    .bind(bar.high)
    .bind(bar.low)
    .bind(bar.close)
    .bind(bar.adj_close)
    .bind(bar.volume)
    .execute(pool)
    .await
    .context("upsert_price_bar failed")?;
    Ok(())
}

/// Daily bars for a set of instruments over `[start, end]`, ordered by
/// (instrument_id, date) ascending. Missing instruments simply contribute no
/// rows.
pub async fn read_prices(
    pool: &PgPool,
    instrument_ids: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceBar>> {
    let rows = sqlx::query(
        r#"
        select instrument_id, date, open, high, low, close, adj_close, volume
        from md_price_daily
        where instrument_id = any($1)
          and date >= $2
          and date <= $3
        order by instrument_id asc, date asc
        "#,
    )
    .bind(instrument_ids)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
    .context("read_prices failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(PriceBar {
            instrument_id: row.try_get("instrument_id")?,
            date: row.try_get("date")?,
            open: row.try_get("open")?,
            high: row.try_get("high")?,
            low: row.try_get("low")?,
            close: row.try_get("close")?,
            adj_close: row.try_get("adj_close")?,
            volume: row.try_get("volume")?,
        });
    }
    Ok(out)
}

/// Latest close at or before `as_of` per instrument. Instruments with no bar
/// are absent from the map.
pub async fn read_latest_closes(
    pool: &PgPool,
    instrument_ids: &[String],
    as_of: NaiveDate,
) -> Result<std::collections::BTreeMap<String, f64>> {
    let rows = sqlx::query(
        r#"
        select distinct on (instrument_id) instrument_id, close
        from md_price_daily
        where instrument_id = any($1)
          and date <= $2
        order by instrument_id asc, date desc
        "#,
    )
    .bind(instrument_ids)
    .bind(as_of)
    .fetch_all(pool)
    .await
    .context("read_latest_closes failed")?;

    let mut out = std::collections::BTreeMap::new();
    for row in rows {
        out.insert(row.try_get("instrument_id")?, row.try_get("close")?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

pub async fn upsert_numeric_embedding(
    pool: &PgPool,
    row: &NumericWindowEmbeddingRow,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into emb_numeric_window
            (entity_type, entity_id, as_of_date, model_id, vector, dim)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (entity_type, entity_id, as_of_date, model_id) do update
            set vector = excluded.vector,
                dim = excluded.dim
        "#,
    )
    .bind(&row.entity_type)
    .bind(&row.entity_id)
    .bind(row.as_of_date)
    .bind(&row.model_id)
    .bind(encode_vector(&row.vector))
    .bind(row.dim)
    .execute(pool)
    .await
    .context("upsert_numeric_embedding failed")?;
    Ok(())
}

pub async fn read_numeric_embedding(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    as_of_date: NaiveDate,
    model_id: &str,
) -> Result<Option<NumericWindowEmbeddingRow>> {
    let row = sqlx::query(
        r#"
        select entity_type, entity_id, as_of_date, model_id, vector, dim
        from emb_numeric_window
        where entity_type = $1
          and entity_id = $2
          and as_of_date = $3
          and model_id = $4
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(as_of_date)
    .bind(model_id)
    .fetch_optional(pool)
    .await
    .context("read_numeric_embedding failed")?;

    let Some(row) = row else { return Ok(None) };
    let dim: i32 = row.try_get("dim")?;
    let bytes: Vec<u8> = row.try_get("vector")?;
    Ok(Some(NumericWindowEmbeddingRow {
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        as_of_date: row.try_get("as_of_date")?,
        model_id: row.try_get("model_id")?,
        vector: decode_vector(&bytes, dim)?,
        dim,
    }))
}

pub async fn upsert_text_embedding(pool: &PgPool, row: &TextEmbeddingRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into emb_text (source_type, source_id, model_id, vector, dim)
        values ($1, $2, $3, $4, $5)
        on conflict (source_type, source_id, model_id) do update
            set vector = excluded.vector,
                dim = excluded.dim
        "#,
    )
    .bind(&row.source_type)
    .bind(&row.source_id)
    .bind(&row.model_id)
    .bind(encode_vector(&row.vector))
    .bind(row.dim)
    .execute(pool)
    .await
    .context("upsert_text_embedding failed")?;
    Ok(())
}

pub async fn read_text_embedding(
    pool: &PgPool,
    source_type: &str,
    source_id: &str,
    model_id: &str,
) -> Result<Option<TextEmbeddingRow>> {
    let row = sqlx::query(
        r#"
        select source_type, source_id, model_id, vector, dim
        from emb_text
        where source_type = $1 and source_id = $2 and model_id = $3
        "#,
    )
    .bind(source_type)
    .bind(source_id)
    .bind(model_id)
    .fetch_optional(pool)
    .await
    .context("read_text_embedding failed")?;

    let Some(row) = row else { return Ok(None) };
    let dim: i32 = row.try_get("dim")?;
    let bytes: Vec<u8> = row.try_get("vector")?;
    Ok(Some(TextEmbeddingRow {
        source_type: row.try_get("source_type")?,
        source_id: row.try_get("source_id")?,
        model_id: row.try_get("model_id")?,
        vector: decode_vector(&bytes, dim)?,
        dim,
    }))
}

pub async fn upsert_joint_embedding(pool: &PgPool, row: &JointEmbeddingRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into emb_joint (joint_type, model_id, as_of_date, entity_scope, vector, dim)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (joint_type, model_id, as_of_date) do update
            set entity_scope = excluded.entity_scope,
                vector = excluded.vector,
                dim = excluded.dim
        "#,
    )
    .bind(&row.joint_type)
    .bind(&row.model_id)
    .bind(row.as_of_date)
    .bind(&row.entity_scope)
    .bind(encode_vector(&row.vector))
    .bind(row.dim)
    .execute(pool)
    .await
    .context("upsert_joint_embedding failed")?;
    Ok(())
}

pub async fn read_joint_embedding(
    pool: &PgPool,
    joint_type: &str,
    model_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<JointEmbeddingRow>> {
    let row = sqlx::query(
        r#"
        select joint_type, model_id, as_of_date, entity_scope, vector, dim
        from emb_joint
        where joint_type = $1 and model_id = $2 and as_of_date = $3
        "#,
    )
    .bind(joint_type)
    .bind(model_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_joint_embedding failed")?;

    let Some(row) = row else { return Ok(None) };
    let dim: i32 = row.try_get("dim")?;
    let bytes: Vec<u8> = row.try_get("vector")?;
    Ok(Some(JointEmbeddingRow {
        joint_type: row.try_get("joint_type")?,
        model_id: row.try_get("model_id")?,
        as_of_date: row.try_get("as_of_date")?,
        entity_scope: row.try_get("entity_scope")?,
        vector: decode_vector(&bytes, dim)?,
        dim,
    }))
}
