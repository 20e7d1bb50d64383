//! Empty target portfolio boundary: once every name drops out of the
//! universe, the book plans zero orders and positions roll forward unchanged.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use pmx_backtest::{run_sleeve_pure, BacktestInput, FragilitySeries, SleeveConfig};
use pmx_calendar::CalendarSpec;
use pmx_config::AssessmentConfig;
use pmx_schemas::{PriceBar, SoftTargetClass};

fn bars(instrument_id: &str, start: NaiveDate, closes: &[f64]) -> Vec<PriceBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| PriceBar {
            instrument_id: instrument_id.to_string(),
            date: start + chrono::Duration::days(i as i64),
            open: *c,
            high: *c,
            low: *c,
            close: *c,
            adj_close: *c,
            volume: 10_000,
        })
        .collect()
}

#[test]
fn breaker_day_empties_the_target_but_keeps_positions() {
    let start: NaiveDate = "2025-03-10".parse().unwrap();
    // Steady uptrend so the name is held from the first fully-covered day.
    let closes: Vec<f64> = (0..5).map(|i| 100.0 * 1.02f64.powi(i)).collect();

    let mut fragility = BTreeMap::new();
    // BREAKER from day 4 onward: the universe drops the name entirely.
    fragility.insert(
        "A".to_string(),
        FragilitySeries {
            points: vec![("2025-03-13".parse().unwrap(), SoftTargetClass::Breaker, 0.9)],
        },
    );

    let cfg = SleeveConfig {
        assessment: AssessmentConfig {
            horizon_days: 2,
            tau_buy: 0.01,
            tau_sell: 0.01,
            ..AssessmentConfig::default()
        },
        ..SleeveConfig::basic("empty-target", "US", "XNYS")
    };

    let input = BacktestInput {
        calendar: CalendarSpec::UsEquity,
        start_date: start,
        end_date: "2025-03-14".parse().unwrap(),
        bars: bars("A", start, &closes),
        sectors: BTreeMap::new(),
        fragility,
        regimes: BTreeMap::new(),
    };

    let report = run_sleeve_pure(&cfg, &input).unwrap();

    // The book held A before the breaker day.
    let held_before: i64 = report
        .trades
        .iter()
        .filter(|t| t.date < "2025-03-13".parse().unwrap())
        .map(|t| t.quantity)
        .sum();
    assert!(held_before > 0, "position must be opened before the breaker day");

    // No trades on or after the breaker day: empty target = hold, not close.
    assert!(
        report
            .trades
            .iter()
            .all(|t| t.date < "2025-03-13".parse().unwrap()),
        "empty target portfolio must plan zero orders"
    );
    assert_eq!(
        report.final_positions.get("A").copied().unwrap_or(0),
        held_before
    );

    // Weight maps on the breaker days are empty.
    for day in report.days.iter().filter(|d| d.date >= "2025-03-13".parse().unwrap()) {
        assert!(day.weights.is_empty(), "{}", day.date);
    }
}
