//! The concrete daily pipeline behind [`PhaseTasks`]: SIGNALS runs Regime,
//! Stability and Assessment; UNIVERSES runs the universe engine; BOOKS runs
//! Portfolio → Risk → Execution.
//!
//! All engine inputs that cannot come from the stores (curated stability
//! registry, crisis triggers, book equity) are injected at construction.
//! The pipeline performs no I/O until a phase method is called.

use chrono::{NaiveDate, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::PgPool;

use pmx_config::PipelineConfig;
use pmx_execution::{apply_execution_plan, BacktestBroker, Broker, ExecutionContext, PaperBroker};
use pmx_regime::PrototypeSet;
use pmx_schemas::{EngineFailure, ExecutionMode, FailureKind};
use pmx_stability::EntityInput;

use crate::PhaseTasks;

pub struct DailyPipeline {
    pub cfg: PipelineConfig,
    pub prototypes: PrototypeSet,
    /// Derived crisis indicators; non-empty activates the regime override.
    pub crisis_triggers: Vec<String>,
    /// Curated registry entities plus instrument entities with features.
    pub stability_entities: Vec<EntityInput>,
    /// Book equity used to size execution deltas.
    pub book_equity: f64,
    pub portfolio_id: String,
    pub strategy_id: String,
}

impl DailyPipeline {
    /// Journal a phase decision when `runs.record_decisions` is on.
    async fn record_decision(
        &self,
        pool: &PgPool,
        engine_name: &str,
        as_of_date: NaiveDate,
        region: &str,
        outputs: serde_json::Value,
    ) -> Result<(), EngineFailure> {
        if !self.cfg.runs.record_decisions {
            return Ok(());
        }
        pmx_db::insert_engine_decision(
            pool,
            &pmx_schemas::EngineDecisionRow {
                decision_id: uuid::Uuid::new_v4(),
                engine_name: engine_name.to_string(),
                strategy_id: self.strategy_id.clone(),
                created_at: Utc::now(),
                inputs: serde_json::json!({
                    "as_of_date": as_of_date,
                    "region": region,
                }),
                outputs,
            },
        )
        .await
        .map_err(db_failure)
    }

    /// The market serving a region, per explicit configuration.
    fn market_for_region(&self, region: &str) -> Result<String, EngineFailure> {
        self.cfg
            .markets
            .iter()
            .find(|(_, m)| m.region == region)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                EngineFailure::input_not_ready(format!("no market configured for region {region}"))
            })
    }

    fn mode(&self) -> Result<ExecutionMode, EngineFailure> {
        ExecutionMode::parse(&self.cfg.execution.mode)
            .map_err(|e| EngineFailure::contract_violation(e.to_string()))
    }

    async fn signals(
        &self,
        pool: &PgPool,
        as_of_date: NaiveDate,
        region: &str,
    ) -> Result<(), EngineFailure> {
        let market_id = self.market_for_region(region)?;

        pmx_regime::run_regime(
            pool,
            region,
            as_of_date,
            &self.cfg.regime,
            &self.prototypes,
            &self.crisis_triggers,
        )
        .await
        .map_err(db_failure)?;

        pmx_stability::run_stability(pool, &self.stability_entities, as_of_date, &self.cfg.stability)
            .await
            .map_err(db_failure)?;

        let instruments = pmx_db::list_instruments(pool, &market_id, as_of_date)
            .await
            .map_err(db_failure)?;
        let request = pmx_assessment::AssessmentRequest {
            strategy_id: self.strategy_id.clone(),
            market_id: market_id.clone(),
            instrument_ids: instruments.iter().map(|i| i.instrument_id.clone()).collect(),
            as_of_date,
        };
        let scores = pmx_assessment::run_assessment(pool, &request, &self.cfg.assessment)
            .await
            .map_err(assessment_failure)?;

        self.record_decision(
            pool,
            "SIGNALS",
            as_of_date,
            region,
            serde_json::json!({ "scores": scores.len() }),
        )
        .await?;
        Ok(())
    }

    async fn universes(
        &self,
        pool: &PgPool,
        as_of_date: NaiveDate,
        region: &str,
    ) -> Result<(), EngineFailure> {
        let market_id = self.market_for_region(region)?;
        let members = pmx_universe::run_universe(
            pool,
            region,
            &market_id,
            as_of_date,
            &self.strategy_id,
            &self.cfg.universe,
            None,
            None,
        )
        .await
        .map_err(db_failure)?;

        self.record_decision(
            pool,
            "UNIVERSES",
            as_of_date,
            region,
            serde_json::json!({
                "members": members.iter().filter(|m| m.in_universe).count(),
                "pool": members.len(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn books(
        &self,
        pool: &PgPool,
        as_of_date: NaiveDate,
        region: &str,
    ) -> Result<(), EngineFailure> {
        let market_id = self.market_for_region(region)?;
        let universe_id = pmx_universe::core_universe_id(region);

        let target = pmx_portfolio::run_portfolio(
            pool,
            &self.portfolio_id,
            &self.strategy_id,
            &market_id,
            &universe_id,
            as_of_date,
            &self.cfg.portfolio,
            &[],
        )
        .await
        .map_err(db_failure)?;
        let weights = pmx_portfolio::weights_of_row(&target);

        // Risk pass: persist every intervention, trade the adjusted book.
        let sectors = pmx_db::fetch_sectors(pool, &market_id)
            .await
            .map_err(db_failure)?;
        let outcome = pmx_risk::apply_risk(
            &self.strategy_id,
            &weights,
            &sectors,
            None,
            Utc::now(),
            &self.cfg.risk,
        );
        pmx_db::insert_risk_actions(pool, &outcome.actions)
            .await
            .map_err(db_failure)?;

        // Execution at the day's closes.
        let ids: Vec<String> = outcome.adjusted.keys().cloned().collect();
        let prices = pmx_db::read_latest_closes(pool, &ids, as_of_date)
            .await
            .map_err(db_failure)?;

        let mode = self.mode()?;
        let ctx = ExecutionContext {
            portfolio_id: &self.portfolio_id,
            strategy_id: &self.strategy_id,
            as_of_date,
            mode,
            equity: self.book_equity,
            prices: &prices,
            cfg: &self.cfg.execution,
        };

        let mut backtest;
        let mut paper;
        let broker: &mut dyn Broker = match mode {
            ExecutionMode::Backtest => {
                backtest = BacktestBroker::new(prices.clone(), self.cfg.execution.slippage_bps);
                &mut backtest
            }
            ExecutionMode::Paper | ExecutionMode::Live => {
                // LIVE broker wiring is external; the daily pipeline defaults
                // to the deterministic paper broker for both paper and live
                // dry-run deployments.
                paper = PaperBroker::new(prices.clone());
                &mut paper
            }
        };

        let fills = apply_execution_plan(pool, &ctx, &outcome.adjusted, broker)
            .await
            .map_err(execution_failure)?;

        self.record_decision(
            pool,
            "BOOKS",
            as_of_date,
            region,
            serde_json::json!({
                "targets": outcome.adjusted.len(),
                "risk_actions": outcome.actions.len(),
                "fills": fills.len(),
            }),
        )
        .await?;
        Ok(())
    }
}

impl PhaseTasks for DailyPipeline {
    fn run_signals<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        self.signals(pool, as_of_date, region).boxed()
    }

    fn run_universes<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        self.universes(pool, as_of_date, region).boxed()
    }

    fn run_books<'a>(
        &'a self,
        pool: &'a PgPool,
        as_of_date: NaiveDate,
        region: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineFailure>> {
        self.books(pool, as_of_date, region).boxed()
    }
}

/// Store/plumbing failures surface as DataIntegrity unless the error chain
/// names an explicit failure kind.
fn db_failure(e: anyhow::Error) -> EngineFailure {
    classify(e, FailureKind::DataIntegrity)
}

fn assessment_failure(e: anyhow::Error) -> EngineFailure {
    classify(e, FailureKind::DataIntegrity)
}

fn execution_failure(e: anyhow::Error) -> EngineFailure {
    classify(e, FailureKind::ContractViolation)
}

fn classify(e: anyhow::Error, default: FailureKind) -> EngineFailure {
    let text = format!("{e:#}");
    let kind = [
        FailureKind::InputNotReady,
        FailureKind::DataIntegrity,
        FailureKind::ContractViolation,
        FailureKind::BrokerTransient,
        FailureKind::RiskLimitExceeded,
        FailureKind::Timeout,
    ]
    .into_iter()
    .find(|k| text.contains(k.as_str()))
    .unwrap_or(default);
    EngineFailure::new(kind, text)
}
