//! Pure transition rules for the engine-run FSM.
//!
//! ```text
//! WAITING_FOR_DATA → DATA_READY
//! DATA_READY       → SIGNALS_RUNNING → {SIGNALS_DONE, FAILED}
//! SIGNALS_DONE     → UNIVERSES_RUNNING → {UNIVERSES_DONE, FAILED}
//! UNIVERSES_DONE   → BOOKS_RUNNING → {BOOKS_DONE, FAILED}
//! BOOKS_DONE       → COMPLETED
//! any non-terminal → FAILED
//! ```

use pmx_schemas::EnginePhase;

/// One dispatchable phase: the resting phase it starts from, the `_RUNNING`
/// hold, the `_DONE` landing, and the stable tag used in `last_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseStep {
    pub from: EnginePhase,
    pub running: EnginePhase,
    pub done: EnginePhase,
    pub tag: &'static str,
}

const STEPS: &[PhaseStep] = &[
    PhaseStep {
        from: EnginePhase::DataReady,
        running: EnginePhase::SignalsRunning,
        done: EnginePhase::SignalsDone,
        tag: "SIGNALS",
    },
    PhaseStep {
        from: EnginePhase::SignalsDone,
        running: EnginePhase::UniversesRunning,
        done: EnginePhase::UniversesDone,
        tag: "UNIVERSES",
    },
    PhaseStep {
        from: EnginePhase::UniversesDone,
        running: EnginePhase::BooksRunning,
        done: EnginePhase::BooksDone,
        tag: "BOOKS",
    },
];

/// The dispatchable step starting at `phase`, if any.
pub fn step_for(phase: EnginePhase) -> Option<PhaseStep> {
    STEPS.iter().copied().find(|s| s.from == phase)
}

/// Stable tag for a `_RUNNING` phase (timeout error strings).
pub fn tag_for_running(phase: EnginePhase) -> &'static str {
    STEPS
        .iter()
        .find(|s| s.running == phase)
        .map(|s| s.tag)
        .unwrap_or("UNKNOWN")
}

/// Whether `from → to` is an allowed edge. Phases are never skipped.
pub fn can_transition(from: EnginePhase, to: EnginePhase) -> bool {
    use EnginePhase::*;

    if from.is_terminal() {
        return false;
    }
    // Any non-terminal phase may fail.
    if to == Failed {
        return true;
    }
    match (from, to) {
        (WaitingForData, DataReady) => true,
        (DataReady, SignalsRunning) => true,
        (SignalsRunning, SignalsDone) => true,
        (SignalsDone, UniversesRunning) => true,
        (UniversesRunning, UniversesDone) => true,
        (UniversesDone, BooksRunning) => true,
        (BooksRunning, BooksDone) => true,
        (BooksDone, Completed) => true,
        _ => false,
    }
}
