//! Compare-and-set phase guards: a stale expectation never overwrites the
//! row, and the (as_of_date, region) key stays unique.

use pmx_schemas::EnginePhase;

#[tokio::test]
async fn cas_rejects_stale_expectations() -> anyhow::Result<()> {
    if std::env::var(pmx_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: {} not set", pmx_db::ENV_DB_URL);
        return Ok(());
    }
    let pool = pmx_db::testkit_db_pool().await?;

    let region = format!("T-{}", uuid::Uuid::new_v4().simple());
    let date = "2025-03-10".parse()?;

    let run = pmx_db::ensure_run(&pool, date, &region).await?;
    assert_eq!(run.phase, EnginePhase::WaitingForData);
    assert_eq!(run.attempts, 0);

    // Winning CAS.
    assert!(
        pmx_db::compare_and_set_phase(
            &pool,
            date,
            &region,
            EnginePhase::WaitingForData,
            EnginePhase::DataReady,
            None,
        )
        .await?
    );

    // Losing CAS: the row is no longer in WAITING_FOR_DATA.
    assert!(
        !pmx_db::compare_and_set_phase(
            &pool,
            date,
            &region,
            EnginePhase::WaitingForData,
            EnginePhase::DataReady,
            None,
        )
        .await?
    );

    // Row is unchanged by the losing attempt.
    let row = pmx_db::fetch_run(&pool, date, &region).await?.unwrap();
    assert_eq!(row.phase, EnginePhase::DataReady);
    assert!(row.last_error.is_none());

    // Uniqueness: re-ensuring returns the same run id.
    let again = pmx_db::ensure_run(&pool, date, &region).await?;
    assert_eq!(again.run_id, row.run_id);

    // Active listing contains the run until it terminates.
    let active = pmx_db::list_active_runs(&pool).await?;
    assert!(active.iter().any(|r| r.region == region));

    assert!(
        pmx_db::compare_and_set_phase(
            &pool,
            date,
            &region,
            EnginePhase::DataReady,
            EnginePhase::Failed,
            Some("SIGNALS_FAILED:DataIntegrity"),
        )
        .await?
    );
    let active = pmx_db::list_active_runs(&pool).await?;
    assert!(!active.iter().any(|r| r.region == region));
    Ok(())
}
