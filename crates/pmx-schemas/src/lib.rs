//! Shared row and value types for the daily engine pipeline.
//!
//! Every engine output table has exactly one row type here; engines own the
//! writes, everything else reads. No I/O in this crate.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod enums;
pub mod failure;

pub use enums::{
    AlertLevel, EnginePhase, ExecutionMode, OrderSide, OrderStatus, OrderType, RegimeLabel,
    RiskActionType, SignalLabel, SoftTargetClass,
};
pub use failure::{EngineFailure, FailureKind};

// ---------------------------------------------------------------------------
// Core dimensions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRow {
    pub instrument_id: String,
    pub market_id: String,
    pub issuer_id: Option<String>,
    pub currency: String,
    /// `ACTIVE` | `DELISTED` | `RESTRICTED`.
    pub status: String,
}

impl InstrumentRow {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerRow {
    pub issuer_id: String,
    pub sector: String,
    pub country: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRow {
    pub market_id: String,
    pub region: String,
    /// Calendar spec name resolved by pmx-calendar (`ALWAYS_ON`, `US_EQUITY`, ...).
    pub calendar_spec: String,
}

// ---------------------------------------------------------------------------
// Time series & embeddings
// ---------------------------------------------------------------------------

/// One daily OHLCV bar. Prices are in the instrument's currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument_id: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: i64,
}

impl PriceBar {
    /// A bar is usable when every price is finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.adj_close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.volume >= 0
    }
}

/// Immutable: changing a `model_id` creates a new row, never a rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericWindowEmbeddingRow {
    pub entity_type: String,
    pub entity_id: String,
    pub as_of_date: NaiveDate,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub dim: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEmbeddingRow {
    pub source_type: String,
    pub source_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub dim: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointEmbeddingRow {
    pub joint_type: String,
    pub model_id: String,
    pub as_of_date: NaiveDate,
    pub entity_scope: Value,
    pub vector: Vec<f32>,
    pub dim: i32,
}

// ---------------------------------------------------------------------------
// Engine outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeStateRow {
    pub region: String,
    pub as_of_date: NaiveDate,
    pub regime_label: RegimeLabel,
    /// In `[0, 1]`; exactly 0 when the label is `UNKNOWN`.
    pub confidence: f64,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeTransitionRow {
    pub region: String,
    pub from_label: RegimeLabel,
    pub to_label: RegimeLabel,
    pub at: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityVectorRow {
    pub entity_type: String,
    pub entity_id: String,
    pub as_of_date: NaiveDate,
    /// Each dimension score in `[0, 1]`.
    pub financial: f64,
    pub political: f64,
    pub operational: f64,
    pub attack_surface: f64,
    /// Soft Target Index, clipped to `[0, 100]`.
    pub soft_target_index: f64,
    pub confidence: f64,
    pub breakdown: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTargetClassRow {
    pub entity_id: String,
    pub as_of_date: NaiveDate,
    pub class: SoftTargetClass,
    pub alert_level: AlertLevel,
    /// Consecutive runs the STI has held above the class's lower threshold.
    pub persistence_days: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeRiskRow {
    pub entity_id: String,
    pub as_of_date: NaiveDate,
    pub horizon_steps: i32,
    pub p_worsen_any: f64,
    pub p_to_targetable_or_breaker: f64,
    /// Monotone in the two probabilities; in `[0, 1]`.
    pub risk_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragilityMeasureRow {
    pub entity_id: String,
    pub as_of_date: NaiveDate,
    pub alpha: f64,
    pub class: SoftTargetClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentScoreRow {
    pub strategy_id: String,
    pub market_id: String,
    pub instrument_id: String,
    pub as_of_date: NaiveDate,
    pub horizon_days: i32,
    pub model_id: String,
    pub score: f64,
    pub expected_return: f64,
    pub confidence: f64,
    pub signal_label: SignalLabel,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseMemberRow {
    pub universe_id: String,
    pub instrument_id: String,
    pub as_of_date: NaiveDate,
    pub in_universe: bool,
    /// 1-based rank among in-universe members; 0 for excluded members.
    pub rank: i32,
    pub scores: Value,
    /// One entry per filter/penalty/bonus applied to this instrument.
    pub reasons: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPortfolioRow {
    pub portfolio_id: String,
    pub as_of_date: NaiveDate,
    /// instrument_id → weight. Long-only invariant: Σ weights ≤ gross_cap + ε.
    pub target_positions: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRiskReportRow {
    pub portfolio_id: String,
    pub as_of_date: NaiveDate,
    pub risk_metrics: Value,
    pub exposures_by_sector: Value,
    pub exposures_by_factor: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskActionRow {
    pub strategy_id: String,
    pub instrument_id: String,
    pub decision_id: Option<Uuid>,
    pub action_type: RiskActionType,
    pub original_weight: f64,
    pub adjusted_weight: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub order_id: Uuid,
    pub portfolio_id: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Always positive; the side carries direction.
    pub quantity: i64,
    pub status: OrderStatus,
    pub mode: ExecutionMode,
    pub timestamp: DateTime<Utc>,
    pub broker_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRow {
    pub fill_id: Uuid,
    pub order_id: Uuid,
    pub instrument_id: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshotRow {
    pub portfolio_id: String,
    pub instrument_id: String,
    pub as_of_date: NaiveDate,
    pub quantity: i64,
    pub avg_cost: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub mode: ExecutionMode,
}

// ---------------------------------------------------------------------------
// Backtest & meta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRunRow {
    pub run_id: Uuid,
    pub strategy_id: String,
    pub sleeve_id: String,
    pub config_json: Value,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub metrics_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestDailyEquityRow {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub equity: f64,
    pub drawdown: f64,
    pub exposures: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTradeRow {
    pub run_id: Uuid,
    pub trade_id: Uuid,
    pub date: NaiveDate,
    pub instrument_id: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub decision_metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDecisionRow {
    pub decision_id: Uuid,
    pub engine_name: String,
    pub strategy_id: String,
    pub created_at: DateTime<Utc>,
    pub inputs: Value,
    pub outputs: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcomeRow {
    pub decision_id: Uuid,
    pub metrics: Value,
    pub reviewed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

/// The only mutable control entity. Uniqueness: `(as_of_date, region)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRunRow {
    pub run_id: Uuid,
    pub as_of_date: NaiveDate,
    pub region: String,
    pub phase: EnginePhase,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EngineRunRow {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Stuck = not terminal and not updated for longer than `2 × phase_timeout`.
    pub fn is_stuck(&self, now: DateTime<Utc>, phase_timeout_seconds: i64) -> bool {
        !self.is_terminal()
            && now.signed_duration_since(self.updated_at).num_seconds()
                > 2 * phase_timeout_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn price_bar_validity_rejects_non_finite_and_non_positive() {
        let mut bar = PriceBar {
            instrument_id: "AAPL.US".into(),
            date: d("2025-03-10"),
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            adj_close: 10.5,
            volume: 1000,
        };
        assert!(bar.is_valid());

        bar.close = f64::NAN;
        assert!(!bar.is_valid());

        bar.close = 0.0;
        assert!(!bar.is_valid());

        bar.close = 10.5;
        bar.volume = -1;
        assert!(!bar.is_valid());
    }

    #[test]
    fn engine_run_stuck_detection() {
        let updated = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let row = EngineRunRow {
            run_id: Uuid::nil(),
            as_of_date: d("2025-03-10"),
            region: "US".into(),
            phase: EnginePhase::SignalsRunning,
            attempts: 1,
            last_error: None,
            updated_at: updated,
        };

        // 2 × 600s = 1200s; 1201s later is stuck.
        let now = updated + chrono::Duration::seconds(1201);
        assert!(row.is_stuck(now, 600));
        let now = updated + chrono::Duration::seconds(1199);
        assert!(!row.is_stuck(now, 600));

        // Terminal rows are never stuck.
        let done = EngineRunRow {
            phase: EnginePhase::Completed,
            ..row
        };
        let much_later = updated + chrono::Duration::days(7);
        assert!(!done.is_stuck(much_later, 600));
    }
}
