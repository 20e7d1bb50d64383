//! Read-through cache over the embedding tables.
//!
//! Cache key is `(entity_type, entity_id, as_of_date, model_id)`; regeneration
//! is skipped unless `force` is set. Concurrent writers race-safe upsert and
//! must produce identical vectors for a fixed model id, so last-write-wins is
//! harmless.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::PgPool;

use pmx_schemas::NumericWindowEmbeddingRow;

use crate::{encode, validate_vector};

pub struct EncoderStore<'a> {
    pool: &'a PgPool,
}

impl<'a> EncoderStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the cached numeric embedding or compute, validate, persist and
    /// return it. `features` is only evaluated on a cache miss.
    pub async fn numeric_embedding<F>(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of_date: NaiveDate,
        model_id: &str,
        force: bool,
        features: F,
    ) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Result<Vec<f64>>,
    {
        if !force {
            if let Some(row) = pmx_db::read_numeric_embedding(
                self.pool,
                entity_type,
                entity_id,
                as_of_date,
                model_id,
            )
            .await?
            {
                validate_vector(model_id, &row.vector)
                    .with_context(|| format!("cached embedding invalid for {entity_id}"))?;
                return Ok(row.vector);
            }
        }

        let feats = features()?;
        let vector = encode(model_id, entity_id, as_of_date, &feats)
            .with_context(|| format!("encode failed for {entity_type}/{entity_id}"))?;

        let row = NumericWindowEmbeddingRow {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            as_of_date,
            model_id: model_id.to_string(),
            dim: vector.len() as i32,
            vector: vector.clone(),
        };
        pmx_db::upsert_numeric_embedding(self.pool, &row).await?;

        Ok(vector)
    }

    /// Cached joint embedding for `(joint_type, model_id, as_of_date)`;
    /// `None` when absent (callers decide fallback vs strict failure).
    pub async fn joint_embedding(
        &self,
        joint_type: &str,
        model_id: &str,
        as_of_date: NaiveDate,
    ) -> Result<Option<Vec<f32>>> {
        let row = pmx_db::read_joint_embedding(self.pool, joint_type, model_id, as_of_date).await?;
        match row {
            Some(r) => {
                validate_vector(model_id, &r.vector)
                    .with_context(|| format!("joint embedding invalid for {joint_type}"))?;
                Ok(Some(r.vector))
            }
            None => Ok(None),
        }
    }
}
