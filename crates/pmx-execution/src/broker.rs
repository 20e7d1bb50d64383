//! The broker seam: one trait, three worlds.
//!
//! BACKTEST and PAPER implementations live here and are fully deterministic.
//! LIVE implementations are external; they only need to satisfy [`Broker`]
//! and be idempotent on retries of the same logical order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use pmx_schemas::{ExecutionMode, FillRow, OrderRow, OrderSide};

#[derive(Clone, Debug, PartialEq)]
pub enum BrokerError {
    /// Connectivity / rate limit; the bridge retries with bounded backoff.
    Transient { detail: String },
    /// The broker refused the order outright; no retry.
    Rejected { detail: String },
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Transient { detail } => write!(f, "broker transient: {detail}"),
            BrokerError::Rejected { detail } => write!(f, "broker rejected: {detail}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Broker-side view of a position, as reported by `get_positions`.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerPosition {
    pub instrument_id: String,
    pub quantity: i64,
    pub avg_price: f64,
}

/// Blocking broker interface consumed by the execution bridge.
pub trait Broker: Send {
    /// Submit an order; returns the broker's provisional reference.
    fn submit(&mut self, order: &OrderRow) -> Result<String, BrokerError>;

    fn cancel(&mut self, broker_ref: &str) -> Result<bool, BrokerError>;

    /// PAPER/LIVE: fills since a timestamp.
    fn poll_fills(&mut self, since: DateTime<Utc>) -> Result<Vec<FillRow>, BrokerError>;

    /// BACKTEST only: deterministic fills for the date.
    fn process_fills(&mut self, as_of_date: NaiveDate) -> Result<Vec<FillRow>, BrokerError>;

    /// Positions as the broker sees them (reconciliation input).
    fn get_positions(&self) -> Vec<BrokerPosition>;
}

/// Deterministic fill timestamp: 21:00 UTC on the trading date (after any
/// regular session close).
pub fn fill_timestamp(as_of_date: NaiveDate) -> DateTime<Utc> {
    as_of_date
        .and_hms_opt(21, 0, 0)
        .expect("21:00:00 is a valid time")
        .and_utc()
}

/// Order timestamp: 20:00 UTC on the trading date.
pub fn order_timestamp(as_of_date: NaiveDate) -> DateTime<Utc> {
    as_of_date
        .and_hms_opt(20, 0, 0)
        .expect("20:00:00 is a valid time")
        .and_utc()
}

// ---------------------------------------------------------------------------
// Backtest broker
// ---------------------------------------------------------------------------

/// Fills every accepted order at `close × (1 ± slippage)`: buys pay up,
/// sells receive less. No randomness, no partial fills.
pub struct BacktestBroker {
    closes: BTreeMap<String, f64>,
    slippage_bps: i64,
    pending: Vec<OrderRow>,
    /// instrument → (signed qty, avg fill price) accumulated over fills.
    book: BTreeMap<String, (i64, f64)>,
}

impl BacktestBroker {
    pub fn new(closes: BTreeMap<String, f64>, slippage_bps: i64) -> Self {
        Self {
            closes,
            slippage_bps,
            pending: Vec::new(),
            book: BTreeMap::new(),
        }
    }

    pub fn set_closes(&mut self, closes: BTreeMap<String, f64>) {
        self.closes = closes;
    }

    fn fill_price(&self, instrument_id: &str, side: OrderSide) -> Option<f64> {
        let close = self.closes.get(instrument_id)?;
        let slip = self.slippage_bps as f64 / 10_000.0;
        Some(match side {
            OrderSide::Buy => close * (1.0 + slip),
            OrderSide::Sell => close * (1.0 - slip),
        })
    }
}

impl Broker for BacktestBroker {
    fn submit(&mut self, order: &OrderRow) -> Result<String, BrokerError> {
        if !self.closes.contains_key(&order.instrument_id) {
            return Err(BrokerError::Rejected {
                detail: format!("no close for {}", order.instrument_id),
            });
        }
        // Idempotent on retries: the same order id replaces, not duplicates.
        self.pending.retain(|o| o.order_id != order.order_id);
        self.pending.push(order.clone());
        Ok(format!("BT-{}", order.order_id.simple()))
    }

    fn cancel(&mut self, broker_ref: &str) -> Result<bool, BrokerError> {
        let before = self.pending.len();
        self.pending
            .retain(|o| format!("BT-{}", o.order_id.simple()) != broker_ref);
        Ok(self.pending.len() < before)
    }

    fn poll_fills(&mut self, _since: DateTime<Utc>) -> Result<Vec<FillRow>, BrokerError> {
        Err(BrokerError::Rejected {
            detail: "poll_fills is not available in BACKTEST".to_string(),
        })
    }

    fn process_fills(&mut self, as_of_date: NaiveDate) -> Result<Vec<FillRow>, BrokerError> {
        let ts = fill_timestamp(as_of_date);
        let mut fills = Vec::with_capacity(self.pending.len());
        let pending: Vec<OrderRow> = self.pending.drain(..).collect();
        for order in pending {
            let fill_price = self
                .fill_price(&order.instrument_id, order.side)
                .expect("submit checked the close exists");
            apply_to_book(&mut self.book, &order.instrument_id, order.side, order.quantity, fill_price);
            fills.push(FillRow {
                fill_id: Uuid::new_v5(&order.order_id, b"fill"),
                order_id: order.order_id,
                instrument_id: order.instrument_id.clone(),
                side: order.side,
                quantity: order.quantity,
                price: fill_price,
                timestamp: ts,
                mode: ExecutionMode::Backtest,
            });
        }
        Ok(fills)
    }

    fn get_positions(&self) -> Vec<BrokerPosition> {
        positions_of_book(&self.book)
    }
}

fn apply_to_book(
    book: &mut BTreeMap<String, (i64, f64)>,
    instrument_id: &str,
    side: OrderSide,
    quantity: i64,
    price: f64,
) {
    let signed = match side {
        OrderSide::Buy => quantity,
        OrderSide::Sell => -quantity,
    };
    let (old_qty, old_avg) = book.get(instrument_id).copied().unwrap_or((0, 0.0));
    let new_qty = old_qty + signed;
    let increases = (old_qty >= 0 && signed > 0) || (old_qty <= 0 && signed < 0);
    let new_avg = if increases {
        (old_qty.abs() as f64 * old_avg + quantity as f64 * price)
            / (old_qty.abs() + quantity).max(1) as f64
    } else if old_qty.signum() != new_qty.signum() && new_qty != 0 {
        price
    } else {
        old_avg
    };
    if new_qty == 0 {
        book.remove(instrument_id);
    } else {
        book.insert(instrument_id.to_string(), (new_qty, new_avg));
    }
}

fn positions_of_book(book: &BTreeMap<String, (i64, f64)>) -> Vec<BrokerPosition> {
    book.iter()
        .map(|(id, (qty, avg))| BrokerPosition {
            instrument_id: id.clone(),
            quantity: *qty,
            avg_price: *avg,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

/// Immediate-ack paper broker: fills at the provided reference price when
/// polled. Deterministic ids from the order id.
pub struct PaperBroker {
    reference_prices: BTreeMap<String, f64>,
    unpolled: Vec<FillRow>,
    book: BTreeMap<String, (i64, f64)>,
}

impl PaperBroker {
    pub fn new(reference_prices: BTreeMap<String, f64>) -> Self {
        Self {
            reference_prices,
            unpolled: Vec::new(),
            book: BTreeMap::new(),
        }
    }
}

impl Broker for PaperBroker {
    fn submit(&mut self, order: &OrderRow) -> Result<String, BrokerError> {
        let price = self
            .reference_prices
            .get(&order.instrument_id)
            .copied()
            .ok_or_else(|| BrokerError::Rejected {
                detail: format!("no reference price for {}", order.instrument_id),
            })?;

        let fill = FillRow {
            fill_id: Uuid::new_v5(&order.order_id, b"paper-fill"),
            order_id: order.order_id,
            instrument_id: order.instrument_id.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            timestamp: order.timestamp,
            mode: ExecutionMode::Paper,
        };
        // Dedupe on resubmission of the same logical order.
        let resubmit = self.unpolled.iter().any(|f| f.fill_id == fill.fill_id);
        if !resubmit {
            apply_to_book(&mut self.book, &order.instrument_id, order.side, order.quantity, price);
            self.unpolled.push(fill);
        }
        Ok(format!("PB-{}", order.order_id.simple()))
    }

    fn cancel(&mut self, _broker_ref: &str) -> Result<bool, BrokerError> {
        Ok(false) // Paper fills are immediate; nothing to cancel.
    }

    fn poll_fills(&mut self, since: DateTime<Utc>) -> Result<Vec<FillRow>, BrokerError> {
        let (ready, keep): (Vec<FillRow>, Vec<FillRow>) = self
            .unpolled
            .drain(..)
            .partition(|f| f.timestamp >= since);
        self.unpolled = keep;
        Ok(ready)
    }

    fn process_fills(&mut self, _as_of_date: NaiveDate) -> Result<Vec<FillRow>, BrokerError> {
        Err(BrokerError::Rejected {
            detail: "process_fills is BACKTEST-only".to_string(),
        })
    }

    fn get_positions(&self) -> Vec<BrokerPosition> {
        positions_of_book(&self.book)
    }
}
