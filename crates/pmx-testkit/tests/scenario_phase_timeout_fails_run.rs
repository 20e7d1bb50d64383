//! A `_RUNNING` phase past its budget is failed with a stable
//! `<TAG>_FAILED:Timeout` error; partial outputs stay in place.

use pmx_config::RunsConfig;
use pmx_runs::{advance_run, ensure_run, mark_data_ready, AdvanceOutcome};
use pmx_schemas::EnginePhase;
use pmx_testkit::{db_pool_or_skip, ScriptedTasks};

#[tokio::test]
async fn stale_running_phase_times_out() -> anyhow::Result<()> {
    let Some(pool) = db_pool_or_skip().await else {
        return Ok(());
    };

    let region = format!("T-{}", uuid::Uuid::new_v4().simple());
    let date = "2025-03-10".parse()?;
    let tasks = ScriptedTasks::all_green();

    ensure_run(&pool, date, &region).await?;
    mark_data_ready(&pool, date, &region).await?;

    // Simulate a worker that claimed SIGNALS and died.
    assert!(
        pmx_db::compare_and_set_phase(
            &pool,
            date,
            &region,
            EnginePhase::DataReady,
            EnginePhase::SignalsRunning,
            None,
        )
        .await?
    );

    // Within budget the heartbeat skips the in-flight run.
    let run = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
    let generous = RunsConfig {
        phase_timeout_seconds: 3_600,
        ..RunsConfig::default()
    };
    assert_eq!(
        advance_run(&pool, &run, &tasks, &generous).await?,
        AdvanceOutcome::Skipped
    );

    // A negative budget makes any in-flight phase stale immediately.
    let expired = RunsConfig {
        phase_timeout_seconds: -1,
        ..RunsConfig::default()
    };
    assert_eq!(
        advance_run(&pool, &run, &tasks, &expired).await?,
        AdvanceOutcome::TimedOut
    );

    let failed = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
    assert_eq!(failed.phase, EnginePhase::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("SIGNALS_FAILED:Timeout"));
    Ok(())
}
