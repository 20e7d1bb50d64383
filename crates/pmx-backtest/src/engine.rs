//! Pure sleeve engine: replay the daily pipeline over preloaded history.
//!
//! Deterministic: same input and config produce byte-identical metrics. The
//! store-backed runner wraps this; tests drive it directly.

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};

use pmx_assessment::{assess_basic, FragilityInput};
use pmx_portfolio::build_weights;
use pmx_risk::apply_risk;
use pmx_schemas::{PriceBar, UniverseMemberRow};
use pmx_universe::{build_universe, core_universe_id, UniverseCandidate};

use crate::metrics::compute_metrics;
use crate::types::{BacktestInput, DailyRecord, SimTrade, SleeveConfig, SleeveReport};

#[derive(Clone, Debug, PartialEq)]
pub enum SleeveError {
    /// Start after end, or no trading days in range.
    EmptyDateRange,
    /// A pipeline stage failed for a date.
    Stage { date: NaiveDate, detail: String },
}

impl std::fmt::Display for SleeveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SleeveError::EmptyDateRange => write!(f, "no trading days in range"),
            SleeveError::Stage { date, detail } => write!(f, "stage failed on {date}: {detail}"),
        }
    }
}

impl std::error::Error for SleeveError {}

/// Evaluate one sleeve over its date range.
pub fn run_sleeve_pure(
    cfg: &SleeveConfig,
    input: &BacktestInput,
) -> Result<SleeveReport, SleeveError> {
    let dates = input
        .calendar
        .trading_days_between(input.start_date, input.end_date);
    if dates.is_empty() {
        return Err(SleeveError::EmptyDateRange);
    }

    // Index bars per instrument, sorted by date.
    let mut by_instrument: BTreeMap<String, Vec<&PriceBar>> = BTreeMap::new();
    for bar in &input.bars {
        by_instrument.entry(bar.instrument_id.clone()).or_default().push(bar);
    }
    for bars in by_instrument.values_mut() {
        bars.sort_by_key(|b| b.date);
    }

    let slip = cfg.slippage_bps as f64 / 10_000.0;

    let mut cash = cfg.initial_cash;
    let mut positions: BTreeMap<String, i64> = BTreeMap::new();
    let mut days: Vec<DailyRecord> = Vec::with_capacity(dates.len());
    let mut trades: Vec<SimTrade> = Vec::new();
    let mut peak_equity = cfg.initial_cash;

    for date in dates {
        let closes = closes_at(&by_instrument, date);
        if closes.is_empty() {
            continue; // No data for the date: nothing to mark or trade.
        }

        let weights = weights_for_date(cfg, input, date, &closes)?;

        // --- EXECUTION: fill deltas at close × (1 ± slippage) ---
        // An empty target book plans zero orders; positions roll forward.
        let equity_before = cash + market_value(&positions, &closes);
        let mut instruments: Vec<String> = if weights.is_empty() {
            Vec::new()
        } else {
            weights.keys().chain(positions.keys()).cloned().collect()
        };
        instruments.sort();
        instruments.dedup();

        for instrument_id in instruments {
            let Some(close) = closes.get(instrument_id.as_str()).copied() else {
                continue; // No price today: hold the position.
            };
            let w = weights.get(instrument_id.as_str()).copied().unwrap_or(0.0);
            let target = ((w * equity_before) / close).floor() as i64;
            let current = positions.get(instrument_id.as_str()).copied().unwrap_or(0);
            let delta = target - current;
            if delta == 0 {
                continue;
            }

            let fill_price = if delta > 0 {
                close * (1.0 + slip)
            } else {
                close * (1.0 - slip)
            };
            cash -= delta as f64 * fill_price;
            let q = positions.entry(instrument_id.clone()).or_insert(0);
            *q += delta;
            if *q == 0 {
                positions.remove(instrument_id.as_str());
            }
            trades.push(SimTrade {
                date,
                instrument_id: instrument_id.clone(),
                quantity: delta,
                price: fill_price,
            });
        }

        // --- Equity curve point ---
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
        return Err(SleeveError::EmptyDateRange);
    }

    let metrics = compute_metrics(cfg, &days, &trades, &input.fragility);

    Ok(SleeveReport {
        days,
        trades,
        final_positions: positions,
        final_cash: cash,
        metrics,
    })
}

/// Run the inline per-phase tasks (assessment → universe → portfolio →
/// optional risk) for one date and return the post-risk target weights.
///
/// This is the sleeve pipeline's "run the same per-phase tasks inline" path;
/// both the pure replay and the store-backed runner use it.
pub fn weights_for_date(
    cfg: &SleeveConfig,
    input: &BacktestInput,
    date: NaiveDate,
    closes: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>, SleeveError> {
    let instruments: std::collections::BTreeSet<String> =
        input.bars.iter().map(|b| b.instrument_id.clone()).collect();

    // --- SIGNALS: assessment per instrument ---
    let mut scores = Vec::new();
    for instrument_id in &instruments {
        let fragility = input
            .fragility
            .get(instrument_id)
            .and_then(|s| s.at(date))
            .map(|(class, risk_score)| FragilityInput {
                class: Some(class),
                risk_score,
            })
            .unwrap_or_default();

        let row = assess_basic(
            &cfg.strategy_id,
            &cfg.market_id,
            instrument_id,
            &input.bars,
            date,
            fragility,
            &cfg.assessment,
        )
        .map_err(|e| SleeveError::Stage {
            date,
            detail: e.to_string(),
        })?;
        scores.push(row);
    }

    // --- UNIVERSES ---
    let universe_id = core_universe_id(&cfg.region);
    let candidates: Vec<UniverseCandidate> = scores
        .iter()
        .map(|s| {
            let fragility = input.fragility.get(&s.instrument_id).and_then(|f| f.at(date));
            UniverseCandidate {
                instrument_id: s.instrument_id.clone(),
                sector: input
                    .sectors
                    .get(&s.instrument_id)
                    .cloned()
                    .unwrap_or_default(),
                last_price: closes.get(&s.instrument_id).copied(),
                adv: None,
                active: true,
                restricted: false,
                stab_class: fragility.map(|(c, _)| c),
                stab_confidence: 1.0,
                stab_risk_score: fragility.map(|(_, r)| r).unwrap_or(0.0),
                base_score: s.score,
                cluster: None,
            }
        })
        .collect();
    let universe: Vec<UniverseMemberRow> =
        build_universe(&universe_id, date, &candidates, None, &cfg.universe);

    // --- BOOKS: portfolio + optional risk ---
    let mut weights =
        build_weights(&universe, &scores, &cfg.portfolio).map_err(|e| SleeveError::Stage {
            date,
            detail: e.to_string(),
        })?;

    if let Some(risk_cfg) = &cfg.risk {
        // Fixed timestamp: the pure path must be replay-identical.
        let now = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let outcome = apply_risk(&cfg.strategy_id, &weights, &input.sectors, None, now, risk_cfg);
        weights = outcome.adjusted;
    }

    Ok(weights)
}

pub(crate) fn closes_at(
    by_instrument: &BTreeMap<String, Vec<&PriceBar>>,
    date: NaiveDate,
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for (id, bars) in by_instrument {
        // Most recent valid close at or before the date.
        if let Some(bar) = bars.iter().rev().find(|b| b.date <= date && b.is_valid()) {
            out.insert(id.clone(), bar.close);
        }
    }
    out
}

pub(crate) fn market_value(positions: &BTreeMap<String, i64>, closes: &BTreeMap<String, f64>) -> f64 {
    positions
        .iter()
        .map(|(id, qty)| *qty as f64 * closes.get(id).copied().unwrap_or(0.0))
        .sum()
}
