//! Backtest runner: replay the daily pipeline across a trading calendar for
//! one sleeve, recording equity, trades and aggregated metrics.

pub mod engine;
pub mod metrics;
pub mod runner;
pub mod types;

pub use engine::{run_sleeve_pure, weights_for_date, SleeveError};
pub use runner::run_sleeve;
pub use types::{
    BacktestInput, DailyRecord, FragilitySeries, SimTrade, SleeveConfig, SleeveReport,
};
