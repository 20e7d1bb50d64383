//! Persistence rim: build the proxy window, classify, apply hysteresis and
//! the crisis override, persist state + transition rows.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use sqlx::PgPool;

use pmx_config::RegimeConfig;
use pmx_encoders::{EncoderStore, PriceWindow};
use pmx_schemas::{RegimeLabel, RegimeStateRow, RegimeTransitionRow};

use crate::{
    apply_hysteresis, classify, state_metadata, unknown_state, HysteresisDecision, PrototypeSet,
};

/// Run the regime engine for one `(region, as_of_date)`.
///
/// `crisis_triggers` are caller-derived indicator names; a non-empty slice
/// activates the hard override (`RISK_OFF_PANIC`, confidence 1.0,
/// `metadata.override = true`), bypassing the hysteresis gate.
///
/// Degraded path: with fewer than `window_days` valid bars the row is
/// persisted as `UNKNOWN` with confidence 0 — never an error.
pub async fn run_regime(
    pool: &PgPool,
    region: &str,
    as_of_date: NaiveDate,
    cfg: &RegimeConfig,
    prototypes: &PrototypeSet,
    crisis_triggers: &[String],
) -> Result<RegimeStateRow> {
    let Some(proxy) = cfg.proxy_instrument_per_region.get(region) else {
        let row = unknown_state(region, as_of_date, "no proxy instrument configured");
        pmx_db::upsert_regime_state(pool, &row).await?;
        return Ok(row);
    };

    // Fetch enough calendar days to cover window_days trading days.
    let lookback_start = as_of_date - Duration::days(cfg.window_days as i64 * 2 + 14);
    let bars = pmx_db::read_prices(pool, &[proxy.clone()], lookback_start, as_of_date)
        .await
        .context("regime proxy price read failed")?;

    let Some(window) = PriceWindow::build(proxy, &bars, as_of_date, cfg.window_days) else {
        let row = unknown_state(
            region,
            as_of_date,
            &format!("fewer than {} valid bars for {}", cfg.window_days, proxy),
        );
        pmx_db::upsert_regime_state(pool, &row).await?;
        return Ok(row);
    };

    let store = EncoderStore::new(pool);
    let embedding = store
        .numeric_embedding(
            "REGION_PROXY",
            proxy,
            as_of_date,
            &cfg.num_regime_model_id,
            false,
            || window.features().map_err(anyhow::Error::from),
        )
        .await
        .context("regime window encoding failed")?;

    let prev = pmx_db::read_prev_regime_state(pool, region, as_of_date).await?;

    let override_active = !crisis_triggers.is_empty();
    let (row, transition) = if override_active {
        // Hard override: immediate transition if the label changes.
        let label = RegimeLabel::RiskOffPanic;
        let transition = prev.as_ref().and_then(|p| {
            (p.regime_label != label).then_some((p.regime_label, label))
        });
        let decision = HysteresisDecision {
            persist_label: label,
            candidate_streak: 0,
            transition,
        };
        let mut metadata = state_metadata(label, &decision, true, None);
        metadata["triggers"] = serde_json::json!(crisis_triggers);
        (
            RegimeStateRow {
                region: region.to_string(),
                as_of_date,
                regime_label: label,
                confidence: 1.0,
                embedding,
                metadata,
            },
            transition,
        )
    } else {
        let classification = classify(&embedding, prototypes, cfg.temperature)
            .context("regime classification failed")?;
        let decision = apply_hysteresis(prev.as_ref(), classification.label, cfg.hysteresis_days);
        let metadata = state_metadata(classification.label, &decision, false, None);
        (
            RegimeStateRow {
                region: region.to_string(),
                as_of_date,
                regime_label: decision.persist_label,
                confidence: classification.confidence,
                embedding,
                metadata,
            },
            decision.transition,
        )
    };

    pmx_db::upsert_regime_state(pool, &row).await?;

    if let Some((from, to)) = transition {
        tracing::info!(%region, %as_of_date, from = from.as_str(), to = to.as_str(), "regime transition");
        pmx_db::insert_regime_transition(
            pool,
            &RegimeTransitionRow {
                region: region.to_string(),
                from_label: from,
                to_label: to,
                at: as_of_date,
            },
        )
        .await?;
    }

    Ok(row)
}
