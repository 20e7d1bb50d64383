//! Forced failure in the BOOKS phase: the run lands in FAILED with a stable
//! `BOOKS_FAILED:` error while the earlier phases' progress survives.

use pmx_config::RunsConfig;
use pmx_runs::{advance_run, ensure_run, mark_data_ready, AdvanceOutcome};
use pmx_schemas::{EnginePhase, FailureKind};
use pmx_testkit::{db_pool_or_skip, ScriptedTasks};

#[tokio::test]
async fn books_failure_is_terminal_with_stable_error() -> anyhow::Result<()> {
    let Some(pool) = db_pool_or_skip().await else {
        return Ok(());
    };

    let region = format!("T-{}", uuid::Uuid::new_v4().simple());
    let date = "2025-03-10".parse()?;
    let tasks = ScriptedTasks {
        fail_books: Some(FailureKind::ContractViolation),
        ..ScriptedTasks::all_green()
    };
    let cfg = RunsConfig::default();

    ensure_run(&pool, date, &region).await?;
    mark_data_ready(&pool, date, &region).await?;

    // SIGNALS and UNIVERSES succeed.
    for want in [EnginePhase::SignalsDone, EnginePhase::UniversesDone] {
        let run = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
        assert_eq!(
            advance_run(&pool, &run, &tasks, &cfg).await?,
            AdvanceOutcome::PhaseCompleted(want)
        );
    }

    // BOOKS fails.
    let run = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
    let outcome = advance_run(&pool, &run, &tasks, &cfg).await?;
    let AdvanceOutcome::Failed(last_error) = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(last_error, "BOOKS_FAILED:ContractViolation");

    let failed = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
    assert_eq!(failed.phase, EnginePhase::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("BOOKS_FAILED:ContractViolation"));
    // Attempts counted all three dispatches, including the failed one.
    assert_eq!(failed.attempts, 3);

    // FAILED is terminal unless manually reset.
    assert_eq!(
        advance_run(&pool, &failed, &tasks, &cfg).await?,
        AdvanceOutcome::Terminal
    );
    Ok(())
}
