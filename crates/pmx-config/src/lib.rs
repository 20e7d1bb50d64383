use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod engines;

pub use engines::{
    AssessmentBackend, AssessmentConfig, ExecutionConfig, PipelineConfig, PortfolioConfig,
    RegimeConfig, RiskLimitsConfig, RunsConfig, StabilityConfig, UniverseConfig,
};

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
///
/// The hash is recorded on backtest runs and decision rows so two runs can be
/// compared by config provenance alone.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    LoadedConfig::from_value(merged)
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Canonicalize an already-merged JSON value and hash it.
    ///
    /// Used directly by backtests, which receive sleeve config as JSON rather
    /// than from files.
    pub fn from_value(merged: Value) -> Result<Self> {
        let canonical = canonicalize_json(&merged);

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hex::encode(hasher.finalize());

        Ok(LoadedConfig {
            config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
            canonical_json: canonical,
            config_hash: hash,
        })
    }

    /// Deserialize the typed pipeline view. Unknown keys are ignored; missing
    /// keys take the documented defaults.
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        serde_json::from_value(self.config_json.clone())
            .context("pipeline config deserialization failed")
    }
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
