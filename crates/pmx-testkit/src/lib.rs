//! Deterministic fixtures and helpers shared by the scenario tests.

use chrono::NaiveDate;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::PgPool;

use pmx_schemas::{EngineFailure, FailureKind, InstrumentRow, MarketRow, PriceBar};
use pmx_runs::PhaseTasks;

pub mod fixtures_csv;

pub use fixtures_csv::{load_price_csv, parse_price_csv, CsvFixtureError};

/// Initialise tracing for tests (idempotent, env-filtered).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connect + migrate, or None when PMX_DATABASE_URL is unset (CI-friendly
/// skip; scenario tests print and return).
pub async fn db_pool_or_skip() -> Option<PgPool> {
    if std::env::var(pmx_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: {} not set", pmx_db::ENV_DB_URL);
        return None;
    }
    Some(
        pmx_db::testkit_db_pool()
            .await
            .expect("test database must be reachable when the env var is set"),
    )
}

/// Build daily bars for one instrument from a close series, starting at
/// `start` and stepping one calendar day per close.
pub fn daily_bars(instrument_id: &str, start: NaiveDate, closes: &[f64]) -> Vec<PriceBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| PriceBar {
            instrument_id: instrument_id.to_string(),
            date: start + chrono::Duration::days(i as i64),
            open: *c,
            high: *c * 1.01,
            low: *c * 0.99,
            close: *c,
            adj_close: *c,
            volume: 100_000,
        })
        .collect()
}

/// Seed a market plus a set of active instruments.
pub async fn seed_market(
    pool: &PgPool,
    market_id: &str,
    region: &str,
    instrument_ids: &[&str],
) -> anyhow::Result<()> {
    pmx_db::upsert_market(
        pool,
        &MarketRow {
            market_id: market_id.to_string(),
            region: region.to_string(),
            calendar_spec: "ALWAYS_ON".to_string(),
        },
    )
    .await?;
    for id in instrument_ids {
        pmx_db::upsert_instrument(
            pool,
            &InstrumentRow {
                instrument_id: id.to_string(),
                market_id: market_id.to_string(),
                issuer_id: None,
                currency: "USD".to_string(),
                status: "ACTIVE".to_string(),
            },
        )
        .await?;
    }
    Ok(())
}

/// Phase tasks with scriptable outcomes, for state-machine scenarios.
pub struct ScriptedTasks {
    pub fail_signals: Option<FailureKind>,
    pub fail_universes: Option<FailureKind>,
    pub fail_books: Option<FailureKind>,
}

impl ScriptedTasks {
    pub fn all_green() -> Self {
        Self {
            fail_signals: None,
            fail_universes: None,
            fail_books: None,
        }
    }

    fn outcome(kind: Option<FailureKind>, phase: &str) -> Result<(), EngineFailure> {
        match kind {
            None => Ok(()),
            Some(k) => Err(EngineFailure::new(k, format!("scripted {phase} failure"))),
        }
    }
}

impl PhaseTasks for ScriptedTasks {
    fn run_signals<'a>(
        &'a self,
        _pool: &'a PgPool,
        _as_of_date: NaiveDate,
        _region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        async move { Self::outcome(self.fail_signals, "signals") }.boxed()
    }

    fn run_universes<'a>(
        &'a self,
        _pool: &'a PgPool,
        _as_of_date: NaiveDate,
        _region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        async move { Self::outcome(self.fail_universes, "universes") }.boxed()
    }

    fn run_books<'a>(
        &'a self,
        _pool: &'a PgPool,
        _as_of_date: NaiveDate,
        _region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        async move { Self::outcome(self.fail_books, "books") }.boxed()
    }
}
