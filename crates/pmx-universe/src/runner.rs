//! Persistence rim for the universe engine: assemble candidates from the
//! stores, run the filter pipeline, upsert member rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use sqlx::PgPool;

use pmx_config::UniverseConfig;
use pmx_schemas::UniverseMemberRow;

use crate::{build_universe, UniverseCandidate};

/// Assemble the base pool for `(region, market_id, as_of_date)` and persist
/// the ranked universe.
///
/// `lambda_scores` is the optional λ̂ cluster-score provider (cluster →
/// score); `clusters` maps instrument → cluster when a provider is present.
pub async fn run_universe(
    pool: &PgPool,
    region: &str,
    market_id: &str,
    as_of_date: NaiveDate,
    strategy_id: &str,
    cfg: &UniverseConfig,
    lambda_scores: Option<&BTreeMap<String, f64>>,
    clusters: Option<&BTreeMap<String, String>>,
) -> Result<Vec<UniverseMemberRow>> {
    let universe_id = crate::core_universe_id(region);

    let instruments = pmx_db::list_instruments(pool, market_id, as_of_date)
        .await
        .context("universe base pool read failed")?;
    let sectors = pmx_db::fetch_sectors(pool, market_id).await?;

    let ids: Vec<String> = instruments.iter().map(|i| i.instrument_id.clone()).collect();
    let closes = pmx_db::read_latest_closes(pool, &ids, as_of_date).await?;

    // ADV over the trailing 20 trading days (approximated by 30 calendar days).
    let adv_start = as_of_date - Duration::days(30);
    let bars = pmx_db::read_prices(pool, &ids, adv_start, as_of_date).await?;
    let mut adv: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for b in &bars {
        let e = adv.entry(b.instrument_id.clone()).or_insert((0.0, 0));
        e.0 += b.close * b.volume as f64;
        e.1 += 1;
    }

    let scores = pmx_db::read_scores_for_date(pool, strategy_id, market_id, as_of_date).await?;
    let score_by_id: BTreeMap<String, f64> = scores
        .iter()
        .map(|s| (s.instrument_id.clone(), s.score))
        .collect();

    let mut candidates = Vec::with_capacity(instruments.len());
    for inst in &instruments {
        let id = &inst.instrument_id;
        let stab = pmx_db::read_latest_soft_target_class(pool, id, as_of_date).await?;
        let stab_confidence = pmx_db::read_stability_vector(pool, "INSTRUMENT", id, as_of_date)
            .await?
            .map(|v| v.confidence)
            .unwrap_or(1.0);
        let risk = pmx_db::read_state_change_risk(pool, id, as_of_date)
            .await?
            .map(|r| r.risk_score)
            .unwrap_or(0.0);

        candidates.push(UniverseCandidate {
            instrument_id: id.clone(),
            sector: sectors.get(id).cloned().unwrap_or_default(),
            last_price: closes.get(id).copied(),
            adv: adv.get(id).map(|(total, n)| total / (*n).max(1) as f64),
            active: inst.is_active(),
            restricted: inst.status == "RESTRICTED",
            stab_class: stab.map(|s| s.class),
            stab_confidence,
            stab_risk_score: risk,
            base_score: score_by_id.get(id).copied().unwrap_or(0.0),
            cluster: clusters.and_then(|c| c.get(id).cloned()),
        });
    }

    let rows = build_universe(&universe_id, as_of_date, &candidates, lambda_scores, cfg);

    pmx_db::upsert_universe_members(pool, &rows).await?;
    tracing::info!(
        %universe_id,
        %as_of_date,
        members = rows.iter().filter(|r| r.in_universe).count(),
        pool = rows.len(),
        "universe persisted"
    );
    Ok(rows)
}
