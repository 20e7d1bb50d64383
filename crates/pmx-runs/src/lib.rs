//! Engine-run state machine: one persistent FSM per `(as_of_date, region)`
//! driving the daily pipeline through its phases.
//!
//! Transition legality is pure ([`fsm`]); `advance_run` applies it against
//! the store with compare-and-set phase updates, so concurrent heartbeats
//! cannot double-dispatch a phase — the loser's CAS simply returns false.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use futures_util::future::BoxFuture;
use sqlx::PgPool;

use pmx_config::RunsConfig;
use pmx_schemas::{EngineFailure, EnginePhase, EngineRunRow};

pub mod fsm;
pub mod pipeline;

pub use fsm::{can_transition, step_for, PhaseStep};
pub use pipeline::DailyPipeline;

/// The per-phase work, injected by the caller. Implementations run the
/// engines; tests inject failures.
///
/// The SIGNALS task runs Regime, Stability, Fragility and Assessment (in that
/// order, or concurrently — they are independent consumers of the store).
pub trait PhaseTasks: Send + Sync {
    fn run_signals<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>>;

    fn run_universes<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>>;

    fn run_books<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>>;
}

/// What one `advance_run` call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A phase task ran and the run moved to its `_DONE` phase.
    PhaseCompleted(EnginePhase),
    /// The run reached COMPLETED.
    Completed,
    /// The task failed; the run is FAILED with `last_error` set.
    Failed(String),
    /// Still waiting for data readiness.
    WaitingForData,
    /// Another worker holds the phase, or the row moved under us.
    Skipped,
    /// A `_RUNNING` phase exceeded its budget and was failed with TIMEOUT.
    TimedOut,
    /// Terminal row; nothing to do.
    Terminal,
}

/// Upsert the run row in WAITING_FOR_DATA (idempotent).
pub async fn ensure_run(
    pool: &PgPool,
    as_of_date: NaiveDate,
    region: &str,
) -> Result<EngineRunRow> {
    pmx_db::ensure_run(pool, as_of_date, region).await
}

/// WAITING_FOR_DATA → DATA_READY. Returns false if the run already left
/// WAITING_FOR_DATA.
pub async fn mark_data_ready(pool: &PgPool, as_of_date: NaiveDate, region: &str) -> Result<bool> {
    pmx_db::compare_and_set_phase(
        pool,
        as_of_date,
        region,
        EnginePhase::WaitingForData,
        EnginePhase::DataReady,
        None,
    )
    .await
}

/// Advance one run by at most one phase.
pub async fn advance_run(
    pool: &PgPool,
    run: &EngineRunRow,
    tasks: &dyn PhaseTasks,
    cfg: &RunsConfig,
) -> Result<AdvanceOutcome> {
    let date = run.as_of_date;
    let region = run.region.as_str();

    if run.phase.is_terminal() {
        return Ok(AdvanceOutcome::Terminal);
    }

    if run.phase == EnginePhase::WaitingForData {
        return Ok(AdvanceOutcome::WaitingForData);
    }

    // A stuck `_RUNNING` phase past its budget fails with TIMEOUT; partial
    // outputs persisted by the phase remain for manual retry.
    if run.phase.is_running() {
        let age = Utc::now().signed_duration_since(run.updated_at).num_seconds();
        if age > cfg.phase_timeout_seconds {
            let tag = fsm::tag_for_running(run.phase);
            let last_error = format!("{tag}_FAILED:Timeout");
            let moved = pmx_db::compare_and_set_phase(
                pool,
                date,
                region,
                run.phase,
                EnginePhase::Failed,
                Some(&last_error),
            )
            .await?;
            return Ok(if moved {
                tracing::warn!(%date, region, %last_error, "phase timed out");
                AdvanceOutcome::TimedOut
            } else {
                AdvanceOutcome::Skipped
            });
        }
        // In flight elsewhere and within budget.
        return Ok(AdvanceOutcome::Skipped);
    }

    if run.phase == EnginePhase::BooksDone {
        let moved = pmx_db::compare_and_set_phase(
            pool,
            date,
            region,
            EnginePhase::BooksDone,
            EnginePhase::Completed,
            None,
        )
        .await?;
        return Ok(if moved {
            tracing::info!(%date, region, "run completed");
            AdvanceOutcome::Completed
        } else {
            AdvanceOutcome::Skipped
        });
    }

    let Some(step) = step_for(run.phase) else {
        return Ok(AdvanceOutcome::Skipped);
    };

    // Claim the phase: only one worker wins this CAS.
    let claimed =
        pmx_db::compare_and_set_phase(pool, date, region, step.from, step.running, None).await?;
    if !claimed {
        return Ok(AdvanceOutcome::Skipped);
    }
    pmx_db::increment_attempts(pool, date, region).await?;

    let result = match step.running {
        EnginePhase::SignalsRunning => tasks.run_signals(pool, date, region).await,
        EnginePhase::UniversesRunning => tasks.run_universes(pool, date, region).await,
        EnginePhase::BooksRunning => tasks.run_books(pool, date, region).await,
        _ => unreachable!("step_for only yields running phases"),
    };

    match result {
        Ok(()) => {
            pmx_db::compare_and_set_phase(pool, date, region, step.running, step.done, None)
                .await?;
            tracing::info!(%date, region, phase = step.done.as_str(), "phase done");
            Ok(AdvanceOutcome::PhaseCompleted(step.done))
        }
        Err(failure) => {
            let last_error = failure.last_error_for_phase(step.tag);
            pmx_db::compare_and_set_phase(
                pool,
                date,
                region,
                step.running,
                EnginePhase::Failed,
                Some(&last_error),
            )
            .await?;
            tracing::error!(%date, region, %last_error, detail = %failure.detail, "phase failed");
            Ok(AdvanceOutcome::Failed(last_error))
        }
    }
}

/// Heartbeat body: advance every active run once. Returns the outcomes in
/// `(date, region)` order.
pub async fn advance_all_active(
    pool: &PgPool,
    tasks: &dyn PhaseTasks,
    cfg: &RunsConfig,
) -> Result<Vec<(EngineRunRow, AdvanceOutcome)>> {
    let active = pmx_db::list_active_runs(pool).await.context("list active runs failed")?;
    let mut out = Vec::with_capacity(active.len());
    for run in active {
        let outcome = advance_run(pool, &run, tasks, cfg).await?;
        out.push((run, outcome));
    }
    Ok(out)
}
