//! Sleeve configuration and preloaded backtest inputs.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pmx_calendar::CalendarSpec;
use pmx_config::{AssessmentConfig, PortfolioConfig, RiskLimitsConfig, UniverseConfig};
use pmx_schemas::{PriceBar, SoftTargetClass};

/// One experimental unit: strategy × market × universe × portfolio ×
/// assessment × horizon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SleeveConfig {
    pub sleeve_id: String,
    pub strategy_id: String,
    pub market_id: String,
    pub region: String,
    pub portfolio_id: String,
    pub initial_cash: f64,
    pub slippage_bps: i64,
    pub assessment: AssessmentConfig,
    pub universe: UniverseConfig,
    pub portfolio: PortfolioConfig,
    pub risk: Option<RiskLimitsConfig>,
}

impl SleeveConfig {
    pub fn basic(sleeve_id: &str, region: &str, market_id: &str) -> Self {
        Self {
            sleeve_id: sleeve_id.to_string(),
            strategy_id: format!("{sleeve_id}-strategy"),
            market_id: market_id.to_string(),
            region: region.to_string(),
            portfolio_id: format!("{sleeve_id}-book"),
            initial_cash: 1_000_000.0,
            slippage_bps: 0,
            assessment: AssessmentConfig::default(),
            universe: UniverseConfig::default(),
            portfolio: PortfolioConfig::default(),
            risk: None,
        }
    }
}

/// Per-instrument fragility series consumed by the pure engine (absent =
/// Stable with zero risk).
#[derive(Clone, Debug, Default)]
pub struct FragilitySeries {
    pub points: Vec<(NaiveDate, SoftTargetClass, f64)>,
}

impl FragilitySeries {
    /// Latest point at or before `date`.
    pub fn at(&self, date: NaiveDate) -> Option<(SoftTargetClass, f64)> {
        self.points
            .iter()
            .filter(|(d, _, _)| *d <= date)
            .last()
            .map(|(_, c, r)| (*c, *r))
    }
}

/// Preloaded history for a pure (store-free) sleeve evaluation.
#[derive(Clone, Debug)]
pub struct BacktestInput {
    pub calendar: CalendarSpec,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// All daily bars for the sleeve's instruments, any order.
    pub bars: Vec<PriceBar>,
    /// instrument → sector (defaults to empty sector).
    pub sectors: BTreeMap<String, String>,
    /// instrument → fragility series.
    pub fragility: BTreeMap<String, FragilitySeries>,
    /// date → prevailing regime label (absent dates fall back to UNKNOWN).
    pub regimes: BTreeMap<NaiveDate, String>,
}

/// One executed backtest trade.
#[derive(Clone, Debug, PartialEq)]
pub struct SimTrade {
    pub date: NaiveDate,
    pub instrument_id: String,
    /// Signed: +buy, −sell.
    pub quantity: i64,
    pub price: f64,
}

/// One day of the sleeve loop.
#[derive(Clone, Debug)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub equity: f64,
    pub drawdown: f64,
    pub regime_label: String,
    /// instrument → weight actually targeted (post-risk).
    pub weights: BTreeMap<String, f64>,
}

/// Full pure-engine output.
#[derive(Clone, Debug)]
pub struct SleeveReport {
    pub days: Vec<DailyRecord>,
    pub trades: Vec<SimTrade>,
    pub final_positions: BTreeMap<String, i64>,
    pub final_cash: f64,
    pub metrics: serde_json::Value,
}
