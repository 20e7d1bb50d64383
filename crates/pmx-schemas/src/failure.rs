//! Failure taxonomy shared by all engines and the run state machine.
//!
//! The state machine records `last_error = "<PHASE>_FAILED:<kind>"`; the kind
//! strings are stable and never change once persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Upstream output absent; caller may wait or treat as soft failure.
    InputNotReady,
    /// Dimension mismatch, non-finite value, negative quantity. Fatal to the
    /// current phase.
    DataIntegrity,
    /// Output violates a contract invariant. Fatal to the phase.
    ContractViolation,
    /// Broker connectivity / rate limit; retried inside the execution bridge.
    BrokerTransient,
    /// Software or book risk reject; logged, does not fail the run.
    RiskLimitExceeded,
    /// Phase exceeded its budget; partial outputs retained.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InputNotReady => "InputNotReady",
            FailureKind::DataIntegrity => "DataIntegrity",
            FailureKind::ContractViolation => "ContractViolation",
            FailureKind::BrokerTransient => "BrokerTransient",
            FailureKind::RiskLimitExceeded => "RiskLimitExceeded",
            FailureKind::Timeout => "Timeout",
        }
    }

    /// Whether a phase hitting this failure must move the run to FAILED.
    pub fn is_fatal_to_phase(&self) -> bool {
        match self {
            FailureKind::DataIntegrity
            | FailureKind::ContractViolation
            | FailureKind::Timeout => true,
            FailureKind::InputNotReady
            | FailureKind::BrokerTransient
            | FailureKind::RiskLimitExceeded => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine failure: a kind plus a short human-readable detail.
///
/// Engines return this from their entry points instead of panicking; the run
/// state machine turns it into a stable `last_error` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl EngineFailure {
    pub fn new<S: Into<String>>(kind: FailureKind, detail: S) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn input_not_ready<S: Into<String>>(detail: S) -> Self {
        Self::new(FailureKind::InputNotReady, detail)
    }

    pub fn data_integrity<S: Into<String>>(detail: S) -> Self {
        Self::new(FailureKind::DataIntegrity, detail)
    }

    pub fn contract_violation<S: Into<String>>(detail: S) -> Self {
        Self::new(FailureKind::ContractViolation, detail)
    }

    /// Stable short string recorded on the run row, e.g.
    /// `SIGNALS_FAILED:DataIntegrity`.
    pub fn last_error_for_phase(&self, phase_tag: &str) -> String {
        format!("{}_FAILED:{}", phase_tag, self.kind.as_str())
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl std::error::Error for EngineFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_strings_are_stable() {
        let f = EngineFailure::data_integrity("non-finite close for AAPL.US");
        assert_eq!(f.last_error_for_phase("SIGNALS"), "SIGNALS_FAILED:DataIntegrity");

        let f = EngineFailure::new(FailureKind::Timeout, "phase budget exceeded");
        assert_eq!(f.last_error_for_phase("BOOKS"), "BOOKS_FAILED:Timeout");
    }

    #[test]
    fn fatality_classification() {
        assert!(FailureKind::DataIntegrity.is_fatal_to_phase());
        assert!(FailureKind::ContractViolation.is_fatal_to_phase());
        assert!(FailureKind::Timeout.is_fatal_to_phase());
        assert!(!FailureKind::BrokerTransient.is_fatal_to_phase());
        assert!(!FailureKind::RiskLimitExceeded.is_fatal_to_phase());
        assert!(!FailureKind::InputNotReady.is_fatal_to_phase());
    }
}
