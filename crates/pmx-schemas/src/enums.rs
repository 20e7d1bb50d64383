//! String-coded enums shared across engines and the persistence layer.
//!
//! Every enum round-trips through `as_str` / `parse` so DB columns stay plain
//! text and mismatches surface as errors at the read site, not as panics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parse failure for any string-coded enum in this module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
                match s {
                    $($code => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Regime classification labels. `Unknown` is the degraded output when a
    /// window cannot be built; it always carries confidence 0.
    ///
    /// Variant order is the lexical order of the wire codes, which is also the
    /// classifier's tie-break order.
    RegimeLabel, "regime label", {
        Carry => "CARRY",
        Crisis => "CRISIS",
        Neutral => "NEUTRAL",
        PolicyRecovery => "POLICY_RECOVERY",
        Recovery => "RECOVERY",
        RiskOffGrinding => "RISK_OFF_GRINDING",
        RiskOffPanic => "RISK_OFF_PANIC",
        RiskOnHighVol => "RISK_ON_HIGH_VOL",
        RiskOnLowVol => "RISK_ON_LOW_VOL",
        Transition => "TRANSITION",
        Unknown => "UNKNOWN",
    }
);

string_enum!(
    /// Soft-target classes, ordered from most to least stable. The derived
    /// `Ord` gives `Stable < Watch < Fragile < Targetable < Breaker`, which is
    /// the severity order used by the persistence gate and the Markov
    /// forecast.
    SoftTargetClass, "soft target class", {
        Stable => "STABLE",
        Watch => "WATCH",
        Fragile => "FRAGILE",
        Targetable => "TARGETABLE",
        Breaker => "BREAKER",
    }
);

impl SoftTargetClass {
    /// Dense index used by the Markov transition matrix.
    pub fn index(&self) -> usize {
        match self {
            SoftTargetClass::Stable => 0,
            SoftTargetClass::Watch => 1,
            SoftTargetClass::Fragile => 2,
            SoftTargetClass::Targetable => 3,
            SoftTargetClass::Breaker => 4,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn alert_level(&self) -> AlertLevel {
        match self {
            SoftTargetClass::Stable | SoftTargetClass::Watch => AlertLevel::Green,
            SoftTargetClass::Fragile => AlertLevel::Yellow,
            SoftTargetClass::Targetable => AlertLevel::Orange,
            SoftTargetClass::Breaker => AlertLevel::Red,
        }
    }
}

string_enum!(
    AlertLevel, "alert level", {
        Green => "GREEN",
        Yellow => "YELLOW",
        Orange => "ORANGE",
        Red => "RED",
    }
);

string_enum!(
    SignalLabel, "signal label", {
        Buy => "BUY",
        Sell => "SELL",
        Hold => "HOLD",
        Skip => "SKIP",
    }
);

string_enum!(
    OrderSide, "order side", {
        Buy => "BUY",
        Sell => "SELL",
    }
);

string_enum!(
    OrderType, "order type", {
        Market => "MARKET",
        Limit => "LIMIT",
    }
);

string_enum!(
    /// Order lifecycle. Status only advances monotonically toward a terminal
    /// state; the execution bridge enforces the ordering.
    OrderStatus, "order status", {
        Pending => "PENDING",
        Submitted => "SUBMITTED",
        PartiallyFilled => "PARTIALLY_FILLED",
        Filled => "FILLED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
    }
);

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Monotonic progress rank. A status update is legal only if the rank
    /// does not decrease and the current status is not terminal.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled => 3,
            OrderStatus::Rejected => 3,
            OrderStatus::Cancelled => 3,
        }
    }

    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

string_enum!(
    ExecutionMode, "execution mode", {
        Backtest => "BACKTEST",
        Paper => "PAPER",
        Live => "LIVE",
    }
);

string_enum!(
    RiskActionType, "risk action type", {
        Ok => "OK",
        Capped => "CAPPED",
        Rejected => "REJECTED",
        Scaled => "SCALED",
        ExecutionReject => "EXECUTION_REJECT",
    }
);

string_enum!(
    /// Engine-run phases. Allowed edges are enforced by `pmx-runs`; this enum
    /// only knows which phases are terminal and which are `_RUNNING` holds.
    EnginePhase, "engine phase", {
        WaitingForData => "WAITING_FOR_DATA",
        DataReady => "DATA_READY",
        SignalsRunning => "SIGNALS_RUNNING",
        SignalsDone => "SIGNALS_DONE",
        UniversesRunning => "UNIVERSES_RUNNING",
        UniversesDone => "UNIVERSES_DONE",
        BooksRunning => "BOOKS_RUNNING",
        BooksDone => "BOOKS_DONE",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

impl EnginePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::Completed | EnginePhase::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EnginePhase::SignalsRunning
                | EnginePhase::UniversesRunning
                | EnginePhase::BooksRunning
        )
    }
}
