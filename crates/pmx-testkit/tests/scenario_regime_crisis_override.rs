//! Crisis override: an active trigger forces RISK_OFF_PANIC with confidence
//! 1.0, `metadata.override = true`, and an immediate transition row.

use std::collections::BTreeMap;

use pmx_config::RegimeConfig;
use pmx_regime::{run_regime, PrototypeSet};
use pmx_schemas::RegimeLabel;
use pmx_testkit::{daily_bars, db_pool_or_skip, seed_market};

#[tokio::test]
async fn trigger_forces_panic_and_logs_transition() -> anyhow::Result<()> {
    let Some(pool) = db_pool_or_skip().await else {
        return Ok(());
    };

    let region = format!("R-{}", uuid::Uuid::new_v4().simple());
    let market = format!("M-{}", uuid::Uuid::new_v4().simple());
    let proxy = format!("PXY-{}", uuid::Uuid::new_v4().simple());
    seed_market(&pool, &market, &region, &[proxy.as_str()]).await?;

    // 80 calm daily bars ending 2025-03-10.
    let start = "2024-12-01".parse()?;
    let closes: Vec<f64> = (0..100).map(|i| 100.0 + (i % 7) as f64 * 0.2).collect();
    for bar in daily_bars(&proxy, start, &closes) {
        pmx_db::upsert_price_bar(&pool, &bar).await?;
    }

    let mut cfg = RegimeConfig::default();
    cfg.proxy_instrument_per_region
        .insert(region.clone(), proxy.clone());

    // Two-label prototype set so the baseline day can never classify as
    // RISK_OFF_PANIC on its own.
    let anchor = pmx_regime::prototype_anchor_date();
    let mut centroids = BTreeMap::new();
    centroids.insert(
        RegimeLabel::Neutral,
        pmx_encoders::encode("num-regime-core-v1", "NEUTRAL", anchor, &[0.01, 0.0, 0.01])?,
    );
    centroids.insert(
        RegimeLabel::Crisis,
        pmx_encoders::encode("num-regime-core-v1", "CRISIS", anchor, &[-0.3, 0.4, -0.5])?,
    );
    let prototypes = PrototypeSet::new(centroids);

    // Day 1: normal classification (whatever label the prototypes yield).
    let day1 = "2025-03-07".parse()?;
    let baseline = run_regime(&pool, &region, day1, &cfg, &prototypes, &[]).await?;
    assert!(baseline.confidence > 0.0);
    assert_ne!(baseline.regime_label, RegimeLabel::RiskOffPanic);

    // Day 2: crisis trigger active.
    let day2 = "2025-03-10".parse()?;
    let state = run_regime(
        &pool,
        &region,
        day2,
        &cfg,
        &prototypes,
        &["vix_spike".to_string()],
    )
    .await?;

    assert_eq!(state.regime_label, RegimeLabel::RiskOffPanic);
    assert_eq!(state.confidence, 1.0);
    assert_eq!(state.metadata["override"], serde_json::json!(true));

    let transitions = pmx_db::regime_transition_history(&pool, &region).await?;
    assert_eq!(transitions.len(), 1, "override bypasses hysteresis");
    assert_eq!(transitions[0].from_label, baseline.regime_label);
    assert_eq!(transitions[0].to_label, RegimeLabel::RiskOffPanic);
    assert_eq!(transitions[0].at, day2);

    // Re-run for the same date: idempotent (no duplicate transition).
    let _ = run_regime(
        &pool,
        &region,
        day2,
        &cfg,
        &prototypes,
        &["vix_spike".to_string()],
    )
    .await?;
    let transitions = pmx_db::regime_transition_history(&pool, &region).await?;
    assert_eq!(transitions.len(), 1);
    Ok(())
}
