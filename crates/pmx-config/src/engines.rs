//! Typed views over the merged config JSON, one struct per engine.
//!
//! Every field has an explicit serde default matching the documented
//! configuration surface, so an empty config is a fully working (if
//! conservative) pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level typed view. Section names match the YAML keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub regime: RegimeConfig,
    pub stability: StabilityConfig,
    pub assessment: AssessmentConfig,
    pub universe: UniverseConfig,
    pub portfolio: PortfolioConfig,
    pub risk: RiskLimitsConfig,
    pub execution: ExecutionConfig,
    pub runs: RunsConfig,
    /// market_id → region. The mapping is many-to-one by convention and is
    /// kept explicit here; nothing in the pipeline infers one from the other.
    pub markets: BTreeMap<String, MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub region: String,
    pub calendar_spec: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            region: "US".to_string(),
            calendar_spec: "US_EQUITY".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// region → proxy instrument id used to build the regime window.
    pub proxy_instrument_per_region: BTreeMap<String, String>,
    pub window_days: usize,
    pub num_regime_model_id: String,
    /// Optional path to a prototype-set file; absent means built-in prototypes.
    pub prototypes_path: Option<String>,
    pub temperature: f64,
    /// Consecutive runs a new label must hold before a transition is written.
    pub hysteresis_days: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            proxy_instrument_per_region: BTreeMap::new(),
            window_days: 63,
            num_regime_model_id: "num-regime-core-v1".to_string(),
            prototypes_path: None,
            temperature: 1.0,
            hysteresis_days: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Stability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Consecutive runs above the lower threshold required per class, keyed by
    /// class code. Classes not listed default to 1.
    pub persistence_days: BTreeMap<String, u32>,
    /// Targetable/Breaker require at least this many sub-scores above their
    /// dimension threshold.
    pub confirmation_min_dims: u32,
    /// Lower bounds for Watch / Fragile / Targetable / Breaker.
    pub sti_thresholds: [f64; 4],
    /// Per-dimension confirmation threshold applied to each sub-score.
    pub dim_threshold: f64,
    pub forecast_horizon_steps: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            persistence_days: BTreeMap::new(),
            confirmation_min_dims: 2,
            sti_thresholds: [30.0, 45.0, 60.0, 75.0],
            dim_threshold: 0.6,
            forecast_horizon_steps: 5,
        }
    }
}

impl StabilityConfig {
    pub fn persistence_for(&self, class_code: &str) -> u32 {
        self.persistence_days.get(class_code).copied().unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentBackend {
    Basic,
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessmentConfig {
    pub backend: AssessmentBackend,
    /// Fail the phase instead of falling back to Basic when a context
    /// embedding is missing.
    pub strict: bool,
    pub horizon_days: u32,
    pub tau_buy: f64,
    pub tau_sell: f64,
    /// λ in `expected_return = μ − λ·σ − β·fragility_penalty`.
    pub vol_penalty: f64,
    /// β in the same expression.
    pub fragility_penalty: f64,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            backend: AssessmentBackend::Basic,
            strict: false,
            horizon_days: 21,
            tau_buy: 0.2,
            tau_sell: 0.2,
            vol_penalty: 0.5,
            fragility_penalty: 0.02,
        }
    }
}

// ---------------------------------------------------------------------------
// Universe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    pub min_price: f64,
    /// Minimum average daily (dollar) volume.
    pub min_liquidity_adv: f64,
    pub max_universe_size: usize,
    pub max_names_per_sector: usize,
    /// Weight of the STAB dynamic penalty: score × (1 − w_stab · risk_score).
    pub w_stab: f64,
    /// Weight of the λ̂ cluster bonus.
    pub w_lambda: f64,
    /// Drop FRAGILE names whose stability confidence is below this bound.
    pub fragile_min_confidence: f64,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            min_price: 1.0,
            min_liquidity_adv: 0.0,
            max_universe_size: 200,
            max_names_per_sector: 25,
            w_stab: 0.5,
            w_lambda: 0.0,
            fragile_min_confidence: 0.25,
        }
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub cap_name: f64,
    pub gross_cap: f64,
    /// Score-power exponent: raw weight ∝ max(score, 0)^γ.
    pub gamma: f64,
    pub scenario_set_ids: Vec<String>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            cap_name: 0.05,
            gross_cap: 1.0,
            gamma: 1.0,
            scenario_set_ids: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimitsConfig {
    pub per_name_cap: f64,
    pub gross_cap: f64,
    pub max_leverage: f64,
    /// sector → cap on the summed |weight| of its names. Empty = no sector caps.
    pub sector_caps: BTreeMap<String, f64>,
    /// Instruments with a hard ban (cap treated as 0).
    pub banned_instruments: Vec<String>,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            per_name_cap: 0.05,
            gross_cap: 1.0,
            max_leverage: 1.0,
            sector_caps: BTreeMap::new(),
            banned_instruments: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// `BACKTEST` | `PAPER` | `LIVE`.
    pub mode: String,
    pub slippage_bps: i64,
    pub exec_risk_enabled: bool,
    pub max_order_notional: f64,
    pub max_position_notional: f64,
    pub max_leverage: f64,
    /// Bounded retries for transient broker errors.
    pub broker_max_retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: "BACKTEST".to_string(),
            slippage_bps: 5,
            exec_risk_enabled: true,
            max_order_notional: 1_000_000.0,
            max_position_notional: 5_000_000.0,
            max_leverage: 1.0,
            broker_max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Per-phase budget; a `_RUNNING` phase older than this fails with TIMEOUT.
    pub phase_timeout_seconds: i64,
    /// Record EngineDecision rows from the daily engines as well.
    pub record_decisions: bool,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            phase_timeout_seconds: 900,
            record_decisions: false,
        }
    }
}
