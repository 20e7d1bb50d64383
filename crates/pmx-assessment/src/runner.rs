//! Persistence rim for the assessment engine.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use sqlx::PgPool;

use pmx_config::{AssessmentBackend, AssessmentConfig};
use pmx_encoders::{encode, EncoderStore, ASSESSMENT_CTX_V0};
use pmx_schemas::{FailureKind, InstrumentScoreRow};

use crate::{
    assess_basic, assess_context, AssessmentError, ContextAffineMap, FragilityInput,
};

/// One assessment invocation: `(strategy, market, instruments, date, horizon)`.
#[derive(Clone, Debug)]
pub struct AssessmentRequest {
    pub strategy_id: String,
    pub market_id: String,
    pub instrument_ids: Vec<String>,
    pub as_of_date: NaiveDate,
}

/// Run the configured backend for every requested instrument and persist the
/// score rows.
///
/// Context backend with a missing `ASSESSMENT_CTX_V0` embedding falls back to
/// Basic unless `strict` is set, in which case the phase fails with
/// `InputNotReady`.
pub async fn run_assessment(
    pool: &PgPool,
    req: &AssessmentRequest,
    cfg: &AssessmentConfig,
) -> Result<Vec<InstrumentScoreRow>> {
    let ctx_vector = match cfg.backend {
        AssessmentBackend::Basic => None,
        AssessmentBackend::Context => {
            let store = EncoderStore::new(pool);
            let v = store
                .joint_embedding("ASSESSMENT_CTX", ASSESSMENT_CTX_V0, req.as_of_date)
                .await?;
            if v.is_none() {
                if cfg.strict {
                    return Err(anyhow::Error::new(AssessmentError::MissingContext {
                        as_of_date: req.as_of_date,
                    })
                    .context(FailureKind::InputNotReady.as_str().to_string()));
                }
                tracing::warn!(
                    as_of_date = %req.as_of_date,
                    "context embedding missing; falling back to basic backend"
                );
            }
            v
        }
    };

    // Price history: twice the horizon in calendar days covers weekends and
    // holidays comfortably.
    let lookback_start = req.as_of_date - Duration::days(cfg.horizon_days as i64 * 2 + 14);
    let bars = pmx_db::read_prices(pool, &req.instrument_ids, lookback_start, req.as_of_date)
        .await
        .context("assessment price read failed")?;

    // Reference direction for the context projection: a synthetic encoder
    // invocation under a fixed (entity, date) anchor, so the axis is a
    // constant of the model rather than drifting day to day.
    let reference = ctx_vector
        .as_ref()
        .map(|_| {
            encode(
                ASSESSMENT_CTX_V0,
                "CTX_REFERENCE",
                reference_anchor_date(),
                &[1.0],
            )
        })
        .transpose()
        .context("reference direction encoding failed")?;

    let mut out = Vec::with_capacity(req.instrument_ids.len());
    for instrument_id in &req.instrument_ids {
        let fragility = read_fragility(pool, instrument_id, req.as_of_date).await?;

        let row = match (&ctx_vector, &reference) {
            (Some(ctx), Some(reference)) => assess_context(
                &req.strategy_id,
                &req.market_id,
                instrument_id,
                ctx,
                reference,
                req.as_of_date,
                fragility,
                ContextAffineMap::default(),
                cfg,
            ),
            _ => assess_basic(
                &req.strategy_id,
                &req.market_id,
                instrument_id,
                &bars,
                req.as_of_date,
                fragility,
                cfg,
            ),
        }
        .with_context(|| format!("assessment failed for {instrument_id}"))?;

        pmx_db::upsert_instrument_score(pool, &row).await?;
        out.push(row);
    }

    Ok(out)
}

/// Anchor key for the reference-direction encoding. Changing it redefines
/// the context projection, so it is part of the model contract.
fn reference_anchor_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("anchor date is valid")
}

async fn read_fragility(
    pool: &PgPool,
    instrument_id: &str,
    as_of_date: NaiveDate,
) -> Result<FragilityInput> {
    let class = pmx_db::read_latest_soft_target_class(pool, instrument_id, as_of_date)
        .await?
        .map(|r| r.class);
    let risk_score = pmx_db::read_state_change_risk(pool, instrument_id, as_of_date)
        .await?
        .map(|r| r.risk_score)
        .unwrap_or(0.0);
    Ok(FragilityInput { class, risk_score })
}
