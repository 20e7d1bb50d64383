//! Order planning: target weights → signed share deltas → planned orders.
//!
//! Deterministic: BTree ordering by instrument, integer share targets, and
//! UUIDv5 order ids derived from `(portfolio, date, instrument, side, qty,
//! mode)` so re-planning an unchanged date reproduces identical orders.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use uuid::Uuid;

use pmx_schemas::{ExecutionMode, OrderSide};

/// Fixed namespace for deterministic order ids.
const ORDER_NS: Uuid = Uuid::from_bytes([
    0x9c, 0x2f, 0x41, 0x7e, 0xa8, 0x11, 0x4e, 0x59, 0x8f, 0x30, 0x6b, 0x21, 0xd4, 0x05, 0x77, 0x4a,
]);

#[derive(Clone, Debug, PartialEq)]
pub enum PlanError {
    /// A nonzero target or position has no price to size against.
    MissingPrice { instrument_id: String },
    /// Price or equity is non-finite or non-positive.
    BadInput { detail: String },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::MissingPrice { instrument_id } => {
                write!(f, "no price for {instrument_id}")
            }
            PlanError::BadInput { detail } => write!(f, "bad plan input: {detail}"),
        }
    }
}

impl std::error::Error for PlanError {}

/// What the delta does to the book.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanKind {
    OpenLong,
    OpenShort,
    Close,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedOrder {
    pub order_id: Uuid,
    pub instrument_id: String,
    pub side: OrderSide,
    /// Always positive.
    pub quantity: i64,
    pub kind: PlanKind,
}

/// Compute planned orders to move from `current` share positions to the
/// target weights at the given prices and equity.
///
/// `target_shares = floor(weight × equity / price)`; one order per nonzero
/// delta, ordered by instrument id.
pub fn plan_orders(
    portfolio_id: &str,
    as_of_date: NaiveDate,
    mode: ExecutionMode,
    equity: f64,
    weights: &BTreeMap<String, f64>,
    prices: &BTreeMap<String, f64>,
    current: &BTreeMap<String, i64>,
) -> Result<Vec<PlannedOrder>, PlanError> {
    if !equity.is_finite() || equity < 0.0 {
        return Err(PlanError::BadInput {
            detail: format!("equity {equity}"),
        });
    }

    let mut instruments: BTreeSet<&String> = BTreeSet::new();
    instruments.extend(weights.keys());
    instruments.extend(current.keys());

    let mut out = Vec::new();
    for id in instruments {
        let w = weights.get(id).copied().unwrap_or(0.0);
        let cur = current.get(id).copied().unwrap_or(0);
        if w == 0.0 && cur == 0 {
            continue;
        }

        let price = match prices.get(id) {
            Some(p) if p.is_finite() && *p > 0.0 => *p,
            Some(p) => {
                return Err(PlanError::BadInput {
                    detail: format!("price {p} for {id}"),
                })
            }
            None => {
                return Err(PlanError::MissingPrice {
                    instrument_id: id.clone(),
                })
            }
        };

        let target = ((w * equity) / price).floor() as i64;
        let delta = target - cur;
        if delta == 0 {
            continue;
        }

        let (side, qty) = if delta > 0 {
            (OrderSide::Buy, delta)
        } else {
            (OrderSide::Sell, -delta)
        };

        let kind = if target == 0 {
            PlanKind::Close
        } else if target > 0 {
            PlanKind::OpenLong
        } else {
            PlanKind::OpenShort
        };

        out.push(PlannedOrder {
            order_id: deterministic_order_id(portfolio_id, as_of_date, mode, id, side, qty),
            instrument_id: id.clone(),
            side,
            quantity: qty,
            kind,
        });
    }
    Ok(out)
}

/// UUIDv5 over the natural order key: identical logical orders get identical
/// ids, so persistence dedupes instead of duplicating.
pub fn deterministic_order_id(
    portfolio_id: &str,
    as_of_date: NaiveDate,
    mode: ExecutionMode,
    instrument_id: &str,
    side: OrderSide,
    quantity: i64,
) -> Uuid {
    let name = format!(
        "{portfolio_id}|{as_of_date}|{mode}|{instrument_id}|{}|{quantity}",
        side.as_str()
    );
    Uuid::new_v5(&ORDER_NS, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        "2025-03-10".parse().unwrap()
    }

    fn maps(
        weights: &[(&str, f64)],
        prices: &[(&str, f64)],
        current: &[(&str, i64)],
    ) -> (
        BTreeMap<String, f64>,
        BTreeMap<String, f64>,
        BTreeMap<String, i64>,
    ) {
        (
            weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            prices.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            current.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        )
    }

    #[test]
    fn plans_buys_to_reach_targets() {
        let (w, p, c) = maps(&[("A", 0.5), ("B", 0.4)], &[("A", 100.0), ("B", 50.0)], &[]);
        let orders =
            plan_orders("P1", date(), ExecutionMode::Backtest, 1_000_000.0, &w, &p, &c).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].instrument_id, "A");
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].quantity, 5_000); // 0.5 × 1e6 / 100
        assert_eq!(orders[0].kind, PlanKind::OpenLong);
        assert_eq!(orders[1].quantity, 8_000); // 0.4 × 1e6 / 50
    }

    #[test]
    fn plans_close_when_weight_drops_to_zero() {
        let (w, p, c) = maps(&[], &[("A", 100.0)], &[("A", 300)]);
        let orders =
            plan_orders("P1", date(), ExecutionMode::Backtest, 1_000_000.0, &w, &p, &c).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, 300);
        assert_eq!(orders[0].kind, PlanKind::Close);
    }

    #[test]
    fn no_delta_no_order() {
        // Already at target.
        let (w, p, c) = maps(&[("A", 0.1)], &[("A", 100.0)], &[("A", 1000)]);
        let orders =
            plan_orders("P1", date(), ExecutionMode::Backtest, 1_000_000.0, &w, &p, &c).unwrap();
        assert!(orders.is_empty());
    }

    #[test]
    fn empty_targets_and_positions_plan_nothing() {
        let (w, p, c) = maps(&[], &[], &[]);
        let orders =
            plan_orders("P1", date(), ExecutionMode::Backtest, 1_000_000.0, &w, &p, &c).unwrap();
        assert!(orders.is_empty());
    }

    #[test]
    fn missing_price_is_an_error() {
        let (w, p, c) = maps(&[("A", 0.5)], &[], &[]);
        let err = plan_orders("P1", date(), ExecutionMode::Backtest, 1e6, &w, &p, &c).unwrap_err();
        assert!(matches!(err, PlanError::MissingPrice { .. }));
    }

    #[test]
    fn non_positive_price_is_an_error() {
        let (w, p, c) = maps(&[("A", 0.5)], &[("A", 0.0)], &[]);
        let err = plan_orders("P1", date(), ExecutionMode::Backtest, 1e6, &w, &p, &c).unwrap_err();
        assert!(matches!(err, PlanError::BadInput { .. }));
    }

    #[test]
    fn order_ids_are_deterministic_and_keyed() {
        let (w, p, c) = maps(&[("A", 0.5)], &[("A", 100.0)], &[]);
        let a = plan_orders("P1", date(), ExecutionMode::Backtest, 1e6, &w, &p, &c).unwrap();
        let b = plan_orders("P1", date(), ExecutionMode::Backtest, 1e6, &w, &p, &c).unwrap();
        assert_eq!(a[0].order_id, b[0].order_id);

        let other_day: NaiveDate = "2025-03-11".parse().unwrap();
        let d = plan_orders("P1", other_day, ExecutionMode::Backtest, 1e6, &w, &p, &c).unwrap();
        assert_ne!(a[0].order_id, d[0].order_id);

        let paper = plan_orders("P1", date(), ExecutionMode::Paper, 1e6, &w, &p, &c).unwrap();
        assert_ne!(a[0].order_id, paper[0].order_id);
    }

    #[test]
    fn shares_floor_toward_zero() {
        let (w, p, c) = maps(&[("A", 0.333)], &[("A", 999.0)], &[]);
        let orders = plan_orders("P1", date(), ExecutionMode::Backtest, 1e4, &w, &p, &c).unwrap();
        // 0.333 × 1e4 / 999 = 3.33… → 3 shares.
        assert_eq!(orders[0].quantity, 3);
    }
}
