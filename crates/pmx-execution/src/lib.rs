//! Execution bridge: plan order deltas from target weights, submit through a
//! broker behind software risk limits, persist orders/fills/snapshots.
//!
//! One planning and persistence path serves BACKTEST, PAPER and LIVE; the
//! broker implementation is the only thing that differs.

pub mod bridge;
pub mod broker;
pub mod plan;
pub mod risk_guard;

pub use bridge::{apply_execution_plan, ExecutionContext};
pub use broker::{BacktestBroker, Broker, BrokerError, BrokerPosition, PaperBroker};
pub use plan::{plan_orders, PlanError, PlanKind, PlannedOrder};
pub use risk_guard::{RiskLimitExceeded, SoftwareRiskGuard};
