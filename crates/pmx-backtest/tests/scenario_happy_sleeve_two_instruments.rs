//! Happy-path sleeve: 2 instruments, 5 trading days, basic assessment,
//! per-name cap 0.5, gross cap 1.0, initial cash 1e6.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use pmx_backtest::{run_sleeve_pure, BacktestInput, SleeveConfig};
use pmx_calendar::CalendarSpec;
use pmx_config::{AssessmentConfig, PortfolioConfig, UniverseConfig};
use pmx_schemas::PriceBar;

fn bars_for(instrument_id: &str, start: NaiveDate, closes: &[f64]) -> Vec<PriceBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| PriceBar {
            instrument_id: instrument_id.to_string(),
            date: start + chrono::Duration::days(i as i64),
            open: *c,
            high: *c * 1.01,
            low: *c * 0.99,
            close: *c,
            adj_close: *c,
            volume: 100_000,
        })
        .collect()
}

fn sleeve() -> SleeveConfig {
    SleeveConfig {
        initial_cash: 1_000_000.0,
        slippage_bps: 0,
        assessment: AssessmentConfig {
            // Short horizon so five days of data give full coverage.
            horizon_days: 4,
            tau_buy: 0.05,
            tau_sell: 0.05,
            ..AssessmentConfig::default()
        },
        universe: UniverseConfig {
            min_price: 1.0,
            ..UniverseConfig::default()
        },
        portfolio: PortfolioConfig {
            cap_name: 0.5,
            gross_cap: 1.0,
            ..PortfolioConfig::default()
        },
        ..SleeveConfig::basic("happy-sleeve", "US", "XNYS")
    }
}

fn input() -> BacktestInput {
    // Monday 2025-03-10 through Friday 2025-03-14: five consecutive trading
    // days on the US calendar.
    let start: NaiveDate = "2025-03-10".parse().unwrap();
    let mut bars = bars_for("A", start, &[100.0, 101.0, 102.0, 101.0, 103.0]);
    bars.extend(bars_for("B", start, &[50.0, 49.0, 51.0, 52.0, 50.0]));

    BacktestInput {
        calendar: CalendarSpec::UsEquity,
        start_date: start,
        end_date: "2025-03-14".parse().unwrap(),
        bars,
        sectors: BTreeMap::new(),
        fragility: BTreeMap::new(),
        regimes: BTreeMap::new(),
    }
}

#[test]
fn five_day_run_produces_finite_metrics_and_consistent_positions() {
    let report = run_sleeve_pure(&sleeve(), &input()).unwrap();

    assert_eq!(report.days.len(), 5, "every trading day yields a record");

    let cumulative = report.metrics["cumulative_return"].as_f64().unwrap();
    assert!(cumulative.is_finite());

    // Signed trade quantities per instrument must reconcile with the final
    // positions.
    let mut net: BTreeMap<String, i64> = BTreeMap::new();
    for t in &report.trades {
        *net.entry(t.instrument_id.clone()).or_insert(0) += t.quantity;
    }
    net.retain(|_, q| *q != 0);
    assert_eq!(net, report.final_positions);

    // Cash accounting: equity = cash + position value at final closes.
    let last = report.days.last().unwrap();
    let final_marks: BTreeMap<&str, f64> = [("A", 103.0), ("B", 50.0)].into_iter().collect();
    let position_value: f64 = report
        .final_positions
        .iter()
        .map(|(id, q)| *q as f64 * final_marks[id.as_str()])
        .sum();
    assert!((last.equity - (report.final_cash + position_value)).abs() < 1e-6);
}

#[test]
fn both_instruments_appear_in_every_universe() {
    // The pure engine reports weights per day; membership is visible through
    // the weight keys only when weights are nonzero, so assert on the trade
    // flow instead: both names must be tradeable every day (valid closes).
    let report = run_sleeve_pure(&sleeve(), &input()).unwrap();
    for day in &report.days {
        assert!(day.equity > 0.0);
    }
    let traded: std::collections::BTreeSet<&str> = report
        .trades
        .iter()
        .map(|t| t.instrument_id.as_str())
        .collect();
    assert!(traded.contains("A"), "A never traded");
}

#[test]
fn replay_is_byte_identical() {
    let a = run_sleeve_pure(&sleeve(), &input()).unwrap();
    let b = run_sleeve_pure(&sleeve(), &input()).unwrap();
    assert_eq!(
        serde_json::to_string(&a.metrics).unwrap(),
        serde_json::to_string(&b.metrics).unwrap()
    );
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.final_positions, b.final_positions);
}

#[test]
fn weights_respect_caps_every_day() {
    let report = run_sleeve_pure(&sleeve(), &input()).unwrap();
    for day in &report.days {
        let gross: f64 = day.weights.values().map(|w| w.abs()).sum();
        assert!(gross <= 1.0 + 1e-9, "gross {gross} on {}", day.date);
        for (id, w) in &day.weights {
            assert!(w.abs() <= 0.5 + 1e-9, "{id} weight {w} on {}", day.date);
        }
    }
}
