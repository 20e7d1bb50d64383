//! Runtime store accessors for the signals group: regimes, stability,
//! assessment scores.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};

use pmx_schemas::{
    AlertLevel, FragilityMeasureRow, InstrumentScoreRow, RegimeLabel, RegimeStateRow,
    RegimeTransitionRow, SignalLabel, SoftTargetClass, SoftTargetClassRow, StabilityVectorRow,
    StateChangeRiskRow,
};

use crate::{decode_vector, encode_vector};

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

pub async fn upsert_regime_state(pool: &PgPool, row: &RegimeStateRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into regime_states (region, as_of_date, regime_label, confidence, embedding, metadata)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (region, as_of_date) do update
            set regime_label = excluded.regime_label,
                confidence = excluded.confidence,
                embedding = excluded.embedding,
                metadata = excluded.metadata
        "#,
    )
    .bind(&row.region)
    .bind(row.as_of_date)
    .bind(row.regime_label.as_str())
    .bind(row.confidence)
    .bind(encode_vector(&row.embedding))
    .bind(&row.metadata)
    .execute(pool)
    .await
    .context("upsert_regime_state failed")?;
    Ok(())
}

fn regime_state_from_row(row: &sqlx::postgres::PgRow) -> Result<RegimeStateRow> {
    let bytes: Vec<u8> = row.try_get("embedding")?;
    let label: String = row.try_get("regime_label")?;
    // Embedding length is bytes/4; regimes do not persist a separate dim column
    // because the label row is keyed by model-config, not model id.
    let dim = (bytes.len() / 4) as i32;
    Ok(RegimeStateRow {
        region: row.try_get("region")?,
        as_of_date: row.try_get("as_of_date")?,
        regime_label: RegimeLabel::parse(&label)?,
        confidence: row.try_get("confidence")?,
        embedding: decode_vector(&bytes, dim)?,
        metadata: row.try_get("metadata")?,
    })
}

pub async fn read_regime_state(
    pool: &PgPool,
    region: &str,
    as_of_date: NaiveDate,
) -> Result<Option<RegimeStateRow>> {
    let row = sqlx::query(
        r#"
        select region, as_of_date, regime_label, confidence, embedding, metadata
        from regime_states
        where region = $1 and as_of_date = $2
        "#,
    )
    .bind(region)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_regime_state failed")?;

    row.as_ref().map(regime_state_from_row).transpose()
}

/// Most recent regime row strictly before `as_of_date` (hysteresis input).
pub async fn read_prev_regime_state(
    pool: &PgPool,
    region: &str,
    as_of_date: NaiveDate,
) -> Result<Option<RegimeStateRow>> {
    let row = sqlx::query(
        r#"
        select region, as_of_date, regime_label, confidence, embedding, metadata
        from regime_states
        where region = $1 and as_of_date < $2
        order by as_of_date desc
        limit 1
        "#,
    )
    .bind(region)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_prev_regime_state failed")?;

    row.as_ref().map(regime_state_from_row).transpose()
}

/// Last `n` regime rows at or before `as_of_date`, newest first.
pub async fn read_recent_regime_states(
    pool: &PgPool,
    region: &str,
    as_of_date: NaiveDate,
    n: i64,
) -> Result<Vec<RegimeStateRow>> {
    let rows = sqlx::query(
        r#"
        select region, as_of_date, regime_label, confidence, embedding, metadata
        from regime_states
        where region = $1 and as_of_date <= $2
        order by as_of_date desc
        limit $3
        "#,
    )
    .bind(region)
    .bind(as_of_date)
    .bind(n)
    .fetch_all(pool)
    .await
    .context("read_recent_regime_states failed")?;

    rows.iter().map(regime_state_from_row).collect()
}

pub async fn insert_regime_transition(pool: &PgPool, row: &RegimeTransitionRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into regime_transitions (region, from_label, to_label, at)
        values ($1, $2, $3, $4)
        on conflict (region, at) do update
            set from_label = excluded.from_label,
                to_label = excluded.to_label
        "#,
    )
    .bind(&row.region)
    .bind(row.from_label.as_str())
    .bind(row.to_label.as_str())
    .bind(row.at)
    .execute(pool)
    .await
    .context("insert_regime_transition failed")?;
    Ok(())
}

pub async fn regime_transition_history(
    pool: &PgPool,
    region: &str,
) -> Result<Vec<RegimeTransitionRow>> {
    let rows = sqlx::query(
        r#"
        select region, from_label, to_label, at
        from regime_transitions
        where region = $1
        order by at asc
        "#,
    )
    .bind(region)
    .fetch_all(pool)
    .await
    .context("regime_transition_history failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let from: String = row.try_get("from_label")?;
        let to: String = row.try_get("to_label")?;
        out.push(RegimeTransitionRow {
            region: row.try_get("region")?,
            from_label: RegimeLabel::parse(&from)?,
            to_label: RegimeLabel::parse(&to)?,
            at: row.try_get("at")?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Stability
// ---------------------------------------------------------------------------

pub async fn upsert_stability_vector(pool: &PgPool, row: &StabilityVectorRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into stability_vectors
            (entity_type, entity_id, as_of_date, financial, political, operational,
             attack_surface, soft_target_index, confidence, breakdown)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (entity_type, entity_id, as_of_date) do update
            set financial = excluded.financial,
                political = excluded.political,
                operational = excluded.operational,
                attack_surface = excluded.attack_surface,
                soft_target_index = excluded.soft_target_index,
                confidence = excluded.confidence,
                breakdown = excluded.breakdown
        "#,
    )
    .bind(&row.entity_type)
    .bind(&row.entity_id)
    .bind(row.as_of_date)
    .bind(row.financial)
    .bind(row.political)
    .bind(row.operational)
    .bind(row.attack_surface)
    .bind(row.soft_target_index)
    .bind(row.confidence)
    .bind(&row.breakdown)
    .execute(pool)
    .await
    .context("upsert_stability_vector failed")?;
    Ok(())
}

pub async fn read_stability_vector(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<StabilityVectorRow>> {
    let row = sqlx::query(
        r#"
        select entity_type, entity_id, as_of_date, financial, political, operational,
               attack_surface, soft_target_index, confidence, breakdown
        from stability_vectors
        where entity_type = $1 and entity_id = $2 and as_of_date = $3
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_stability_vector failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(StabilityVectorRow {
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        as_of_date: row.try_get("as_of_date")?,
        financial: row.try_get("financial")?,
        political: row.try_get("political")?,
        operational: row.try_get("operational")?,
        attack_surface: row.try_get("attack_surface")?,
        soft_target_index: row.try_get("soft_target_index")?,
        confidence: row.try_get("confidence")?,
        breakdown: row.try_get("breakdown")?,
    }))
}

/// Last `n` stability vectors strictly before `before`, newest first.
pub async fn read_recent_stability_vectors(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    before: NaiveDate,
    n: i64,
) -> Result<Vec<StabilityVectorRow>> {
    let rows = sqlx::query(
        r#"
        select entity_type, entity_id, as_of_date, financial, political, operational,
               attack_surface, soft_target_index, confidence, breakdown
        from stability_vectors
        where entity_type = $1 and entity_id = $2 and as_of_date < $3
        order by as_of_date desc
        limit $4
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(before)
    .bind(n)
    .fetch_all(pool)
    .await
    .context("read_recent_stability_vectors failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(StabilityVectorRow {
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            as_of_date: row.try_get("as_of_date")?,
            financial: row.try_get("financial")?,
            political: row.try_get("political")?,
            operational: row.try_get("operational")?,
            attack_surface: row.try_get("attack_surface")?,
            soft_target_index: row.try_get("soft_target_index")?,
            confidence: row.try_get("confidence")?,
            breakdown: row.try_get("breakdown")?,
        });
    }
    Ok(out)
}

pub async fn upsert_soft_target_class(pool: &PgPool, row: &SoftTargetClassRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into soft_target_classes (entity_id, as_of_date, class, alert_level, persistence_days)
        values ($1, $2, $3, $4, $5)
        on conflict (entity_id, as_of_date) do update
            set class = excluded.class,
                alert_level = excluded.alert_level,
                persistence_days = excluded.persistence_days
        "#,
    )
    .bind(&row.entity_id)
    .bind(row.as_of_date)
    .bind(row.class.as_str())
    .bind(row.alert_level.as_str())
    .bind(row.persistence_days)
    .execute(pool)
    .await
    .context("upsert_soft_target_class failed")?;
    Ok(())
}

fn soft_target_class_from_row(row: &sqlx::postgres::PgRow) -> Result<SoftTargetClassRow> {
    let class: String = row.try_get("class")?;
    let alert: String = row.try_get("alert_level")?;
    Ok(SoftTargetClassRow {
        entity_id: row.try_get("entity_id")?,
        as_of_date: row.try_get("as_of_date")?,
        class: SoftTargetClass::parse(&class)?,
        alert_level: AlertLevel::parse(&alert)?,
        persistence_days: row.try_get("persistence_days")?,
    })
}

pub async fn read_soft_target_class(
    pool: &PgPool,
    entity_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<SoftTargetClassRow>> {
    let row = sqlx::query(
        r#"
        select entity_id, as_of_date, class, alert_level, persistence_days
        from soft_target_classes
        where entity_id = $1 and as_of_date = $2
        "#,
    )
    .bind(entity_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_soft_target_class failed")?;

    row.as_ref().map(soft_target_class_from_row).transpose()
}

/// Latest class at or before `as_of_date` (persistence-gate input).
pub async fn read_latest_soft_target_class(
    pool: &PgPool,
    entity_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<SoftTargetClassRow>> {
    let row = sqlx::query(
        r#"
        select entity_id, as_of_date, class, alert_level, persistence_days
        from soft_target_classes
        where entity_id = $1 and as_of_date <= $2
        order by as_of_date desc
        limit 1
        "#,
    )
    .bind(entity_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_latest_soft_target_class failed")?;

    row.as_ref().map(soft_target_class_from_row).transpose()
}

/// Observed class sequence per entity, oldest first, for Markov fitting.
pub async fn read_class_history(
    pool: &PgPool,
    entity_id: &str,
    until: NaiveDate,
) -> Result<Vec<SoftTargetClassRow>> {
    let rows = sqlx::query(
        r#"
        select entity_id, as_of_date, class, alert_level, persistence_days
        from soft_target_classes
        where entity_id = $1 and as_of_date <= $2
        order by as_of_date asc
        "#,
    )
    .bind(entity_id)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("read_class_history failed")?;

    rows.iter().map(soft_target_class_from_row).collect()
}

pub async fn upsert_state_change_risk(pool: &PgPool, row: &StateChangeRiskRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into state_change_risk
            (entity_id, as_of_date, horizon_steps, p_worsen_any,
             p_to_targetable_or_breaker, risk_score)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (entity_id, as_of_date) do update
            set horizon_steps = excluded.horizon_steps,
                p_worsen_any = excluded.p_worsen_any,
                p_to_targetable_or_breaker = excluded.p_to_targetable_or_breaker,
                risk_score = excluded.risk_score
        "#,
    )
    .bind(&row.entity_id)
    .bind(row.as_of_date)
    .bind(row.horizon_steps)
    .bind(row.p_worsen_any)
    .bind(row.p_to_targetable_or_breaker)
    .bind(row.risk_score)
    .execute(pool)
    .await
    .context("upsert_state_change_risk failed")?;
    Ok(())
}

pub async fn read_state_change_risk(
    pool: &PgPool,
    entity_id: &str,
    as_of_date: NaiveDate,
) -> Result<Option<StateChangeRiskRow>> {
    let row = sqlx::query(
        r#"
        select entity_id, as_of_date, horizon_steps, p_worsen_any,
               p_to_targetable_or_breaker, risk_score
        from state_change_risk
        where entity_id = $1 and as_of_date = $2
        "#,
    )
    .bind(entity_id)
    .bind(as_of_date)
    .fetch_optional(pool)
    .await
    .context("read_state_change_risk failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(StateChangeRiskRow {
        entity_id: row.try_get("entity_id")?,
        as_of_date: row.try_get("as_of_date")?,
        horizon_steps: row.try_get("horizon_steps")?,
        p_worsen_any: row.try_get("p_worsen_any")?,
        p_to_targetable_or_breaker: row.try_get("p_to_targetable_or_breaker")?,
        risk_score: row.try_get("risk_score")?,
    }))
}

pub async fn upsert_fragility_measure(pool: &PgPool, row: &FragilityMeasureRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into fragility_measures (entity_id, as_of_date, alpha, class)
        values ($1, $2, $3, $4)
        on conflict (entity_id, as_of_date) do update
            set alpha = excluded.alpha,
                class = excluded.class
        "#,
    )
    .bind(&row.entity_id)
    .bind(row.as_of_date)
    .bind(row.alpha)
    .bind(row.class.as_str())
    .execute(pool)
    .await
    .context("upsert_fragility_measure failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Assessment scores
// ---------------------------------------------------------------------------

pub async fn upsert_instrument_score(pool: &PgPool, row: &InstrumentScoreRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into instrument_scores
            (strategy_id, market_id, instrument_id, as_of_date, horizon_days,
             model_id, score, expected_return, confidence, signal_label, metadata)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        on conflict (strategy_id, instrument_id, as_of_date, horizon_days, model_id) do update
            set market_id = excluded.market_id,
                score = excluded.score,
                expected_return = excluded.expected_return,
                confidence = excluded.confidence,
                signal_label = excluded.signal_label,
                metadata = excluded.metadata
        "#,
    )
    .bind(&row.strategy_id)
    .bind(&row.market_id)
    .bind(&row.instrument_id)
    .bind(row.as_of_date)
    .bind(row.horizon_days)
    .bind(&row.model_id)
    .bind(row.score)
    .bind(row.expected_return)
    .bind(row.confidence)
    .bind(row.signal_label.as_str())
    .bind(&row.metadata)
    .execute(pool)
    .await
    .context("upsert_instrument_score failed")?;
    Ok(())
}

fn score_from_row(row: &sqlx::postgres::PgRow) -> Result<InstrumentScoreRow> {
    let label: String = row.try_get("signal_label")?;
    Ok(InstrumentScoreRow {
        strategy_id: row.try_get("strategy_id")?,
        market_id: row.try_get("market_id")?,
        instrument_id: row.try_get("instrument_id")?,
        as_of_date: row.try_get("as_of_date")?,
        horizon_days: row.try_get("horizon_days")?,
        model_id: row.try_get("model_id")?,
        score: row.try_get("score")?,
        expected_return: row.try_get("expected_return")?,
        confidence: row.try_get("confidence")?,
        signal_label: SignalLabel::parse(&label)?,
        metadata: row.try_get("metadata")?,
    })
}

/// Latest score at or before `as_of` for one instrument and horizon.
pub async fn read_latest_score(
    pool: &PgPool,
    strategy_id: &str,
    instrument_id: &str,
    as_of: NaiveDate,
    horizon_days: i32,
) -> Result<Option<InstrumentScoreRow>> {
    let row = sqlx::query(
        r#"
        select strategy_id, market_id, instrument_id, as_of_date, horizon_days,
               model_id, score, expected_return, confidence, signal_label, metadata
        from instrument_scores
        where strategy_id = $1
          and instrument_id = $2
          and as_of_date <= $3
          and horizon_days = $4
        order by as_of_date desc
        limit 1
        "#,
    )
    .bind(strategy_id)
    .bind(instrument_id)
    .bind(as_of)
    .bind(horizon_days)
    .fetch_optional(pool)
    .await
    .context("read_latest_score failed")?;

    row.as_ref().map(score_from_row).transpose()
}

/// All scores for a (strategy, market, date), ordered by instrument.
pub async fn read_scores_for_date(
    pool: &PgPool,
    strategy_id: &str,
    market_id: &str,
    as_of_date: NaiveDate,
) -> Result<Vec<InstrumentScoreRow>> {
    let rows = sqlx::query(
        r#"
        select strategy_id, market_id, instrument_id, as_of_date, horizon_days,
               model_id, score, expected_return, confidence, signal_label, metadata
        from instrument_scores
        where strategy_id = $1 and market_id = $2 and as_of_date = $3
        order by instrument_id asc
        "#,
    )
    .bind(strategy_id)
    .bind(market_id)
    .bind(as_of_date)
    .fetch_all(pool)
    .await
    .context("read_scores_for_date failed")?;

    rows.iter().map(score_from_row).collect()
}
