//! Persistence rim for the stability engine.
//!
//! Feature derivation is injected by the caller (registry entities carry
//! curated features; instruments derive theirs from price history upstream).
//! The runner reads prior rows for gates and the Markov fit, computes, and
//! upserts all four output tables.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::PgPool;

use pmx_config::StabilityConfig;
use pmx_schemas::{
    FragilityMeasureRow, SoftTargetClassRow, StabilityVectorRow, StateChangeRiskRow,
};

use crate::forecast::{forecast, TransitionMatrix};
use crate::{
    apply_class_gates, breakdown_json, compute_sub_scores, fragility_measure, soft_target_index,
    EntityProfile, StabilityFeatures,
};

/// One entity's input for a stability run.
#[derive(Clone, Debug)]
pub struct EntityInput {
    pub profile: EntityProfile,
    pub features: StabilityFeatures,
}

/// Run the stability engine for a set of entities on one date.
///
/// Returns the persisted class rows (in input order) for callers that chain
/// into assessment.
pub async fn run_stability(
    pool: &PgPool,
    entities: &[EntityInput],
    as_of_date: NaiveDate,
    cfg: &StabilityConfig,
) -> Result<Vec<SoftTargetClassRow>> {
    // Fit one transition matrix per run from all observed class histories.
    let mut sequences = Vec::with_capacity(entities.len());
    for e in entities {
        let history = pmx_db::read_class_history(pool, &e.profile.entity_id, as_of_date)
            .await
            .context("class history read failed")?;
        if history.len() >= 2 {
            sequences.push(history.iter().map(|r| r.class).collect());
        }
    }
    let matrix = TransitionMatrix::fit(&sequences);

    let mut out = Vec::with_capacity(entities.len());
    for e in entities {
        let row = run_entity(pool, e, as_of_date, cfg, &matrix).await?;
        out.push(row);
    }
    Ok(out)
}

async fn run_entity(
    pool: &PgPool,
    entity: &EntityInput,
    as_of_date: NaiveDate,
    cfg: &StabilityConfig,
    matrix: &TransitionMatrix,
) -> Result<SoftTargetClassRow> {
    let id = &entity.profile.entity_id;
    let scores = compute_sub_scores(&entity.features);
    let sti = soft_target_index(&entity.profile, &scores);

    // STI history for the persistence gate: prior vectors plus today.
    let mut sti_history = read_sti_history(pool, &entity.profile, as_of_date).await?;
    sti_history.push(sti);

    let prev_class = pmx_db::read_latest_soft_target_class(pool, id, as_of_date)
        .await?
        .filter(|r| r.as_of_date < as_of_date)
        .map(|r| r.class);

    let gated = apply_class_gates(&sti_history, &scores, prev_class, cfg);

    // Coarse confidence: curated features present vs. absent.
    let confidence = if entity.features.is_empty() { 0.25 } else { 0.9 };

    let vector = StabilityVectorRow {
        entity_type: entity.profile.entity_type.clone(),
        entity_id: id.clone(),
        as_of_date,
        financial: scores.financial,
        political: scores.political,
        operational: scores.operational,
        attack_surface: scores.attack_surface,
        soft_target_index: sti,
        confidence,
        breakdown: breakdown_json(&entity.profile, &scores, &gated),
    };
    pmx_db::upsert_stability_vector(pool, &vector).await?;

    let class_row = SoftTargetClassRow {
        entity_id: id.clone(),
        as_of_date,
        class: gated.class,
        alert_level: gated.class.alert_level(),
        persistence_days: gated.persistence_days,
    };
    pmx_db::upsert_soft_target_class(pool, &class_row).await?;

    let fc = forecast(matrix, gated.class, cfg.forecast_horizon_steps);
    pmx_db::upsert_state_change_risk(
        pool,
        &StateChangeRiskRow {
            entity_id: id.clone(),
            as_of_date,
            horizon_steps: fc.horizon_steps as i32,
            p_worsen_any: fc.p_worsen_any,
            p_to_targetable_or_breaker: fc.p_to_targetable_or_breaker,
            risk_score: fc.risk_score,
        },
    )
    .await?;

    let (alpha, fragility_class) = fragility_measure(sti, fc.risk_score, &cfg.sti_thresholds);
    pmx_db::upsert_fragility_measure(
        pool,
        &FragilityMeasureRow {
            entity_id: id.clone(),
            as_of_date,
            alpha,
            class: fragility_class,
        },
    )
    .await?;

    Ok(class_row)
}

/// Prior STI values (oldest→newest, strictly before `as_of_date`).
/// Persistence windows are small (1–5 runs); 8 rows is a safe upper bound.
async fn read_sti_history(
    pool: &PgPool,
    profile: &EntityProfile,
    as_of_date: NaiveDate,
) -> Result<Vec<f64>> {
    let mut rows = pmx_db::read_recent_stability_vectors(
        pool,
        &profile.entity_type,
        &profile.entity_id,
        as_of_date,
        8,
    )
    .await?;
    rows.reverse();
    Ok(rows.into_iter().map(|r| r.soft_target_index).collect())
}
