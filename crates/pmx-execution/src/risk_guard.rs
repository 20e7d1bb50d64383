//! Software risk limits checked before any broker call.

use std::collections::BTreeMap;
use std::fmt;

use pmx_config::ExecutionConfig;
use pmx_schemas::OrderSide;

use crate::plan::PlannedOrder;

/// Raised when a planned order breaches a software limit. The bridge logs an
/// `EXECUTION_REJECT` risk action and never submits the order.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskLimitExceeded {
    pub instrument_id: String,
    pub limit: &'static str,
    pub value: f64,
    pub bound: f64,
}

impl fmt::Display for RiskLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {:.2} exceeds {:.2}",
            self.instrument_id, self.limit, self.value, self.bound
        )
    }
}

impl std::error::Error for RiskLimitExceeded {}

/// Order-time limit checks against current prices and positions.
pub struct SoftwareRiskGuard<'a> {
    cfg: &'a ExecutionConfig,
    prices: &'a BTreeMap<String, f64>,
    positions: &'a BTreeMap<String, i64>,
    equity: f64,
}

impl<'a> SoftwareRiskGuard<'a> {
    pub fn new(
        cfg: &'a ExecutionConfig,
        prices: &'a BTreeMap<String, f64>,
        positions: &'a BTreeMap<String, i64>,
        equity: f64,
    ) -> Self {
        Self {
            cfg,
            prices,
            positions,
            equity,
        }
    }

    /// Check one planned order. Disabled guard (`exec_risk_enabled = false`)
    /// always passes.
    pub fn check(&self, order: &PlannedOrder) -> Result<(), RiskLimitExceeded> {
        if !self.cfg.exec_risk_enabled {
            return Ok(());
        }

        let price = self
            .prices
            .get(&order.instrument_id)
            .copied()
            .unwrap_or(0.0);
        let order_notional = order.quantity as f64 * price;

        if order_notional > self.cfg.max_order_notional {
            return Err(RiskLimitExceeded {
                instrument_id: order.instrument_id.clone(),
                limit: "max_order_notional",
                value: order_notional,
                bound: self.cfg.max_order_notional,
            });
        }

        let current = self
            .positions
            .get(&order.instrument_id)
            .copied()
            .unwrap_or(0);
        let signed_qty = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };
        let resulting = current + signed_qty;
        let position_notional = (resulting.abs() as f64) * price;
        if position_notional > self.cfg.max_position_notional {
            return Err(RiskLimitExceeded {
                instrument_id: order.instrument_id.clone(),
                limit: "max_position_notional",
                value: position_notional,
                bound: self.cfg.max_position_notional,
            });
        }

        // Leverage: gross notional after this order against equity. Only
        // meaningful with positive equity.
        if self.equity > 0.0 {
            let mut gross = 0.0;
            for (id, qty) in self.positions {
                let q = if id == &order.instrument_id { resulting } else { *qty };
                gross += (q.abs() as f64) * self.prices.get(id).copied().unwrap_or(0.0);
            }
            if !self.positions.contains_key(&order.instrument_id) {
                gross += (resulting.abs() as f64) * price;
            }
            let leverage = gross / self.equity;
            if leverage > self.cfg.max_leverage {
                return Err(RiskLimitExceeded {
                    instrument_id: order.instrument_id.clone(),
                    limit: "max_leverage",
                    value: leverage,
                    bound: self.cfg.max_leverage,
                });
            }
        }

        Ok(())
    }
}
