// crates/pmx-db/src/lib.rs
//
// Persistence & reader layer. Two logical stores share one pool:
// - historical (md_*, emb_*): append-only reference data and embeddings;
// - runtime (everything else): engine outputs and the control plane.
// Writes never span the two stores in one transaction; every consumer must
// tolerate either store being slightly stale.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod books;
pub mod control;
pub mod execution;
pub mod historical;
pub mod signals;

pub use books::*;
pub use control::*;
pub use execution::*;
pub use historical::*;
pub use signals::*;

pub const ENV_DB_URL: &str = "PMX_DATABASE_URL";

/// Connect to Postgres using PMX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    dotenvy::dotenv().ok();
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    tracing::info!("connected to runtime/historical stores");
    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using PMX_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations. Migrations are strictly additive.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='engine_runs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_engine_runs_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_engine_runs_table: bool,
}

// ---------------------------------------------------------------------------
// Embedding vector codec
// ---------------------------------------------------------------------------

/// Encode an f32 vector as dim * 4 bytes of little-endian float32.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode little-endian float32 bytes, validating against the declared dim.
pub fn decode_vector(bytes: &[u8], dim: i32) -> Result<Vec<f32>> {
    let dim = usize::try_from(dim).context("negative embedding dim")?;
    if bytes.len() != dim * 4 {
        anyhow::bail!(
            "embedding byte length {} does not match dim {} (expected {})",
            bytes.len(),
            dim,
            dim * 4
        );
    }
    let mut out = Vec::with_capacity(dim);
    for chunk in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_codec_round_trips() {
        let v = vec![0.0f32, 1.5, -2.25, f32::MIN_POSITIVE];
        let bytes = encode_vector(&v);
        assert_eq!(bytes.len(), 16);
        let back = decode_vector(&bytes, 4).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn vector_codec_rejects_length_mismatch() {
        let bytes = encode_vector(&[1.0f32, 2.0]);
        let err = decode_vector(&bytes, 3).unwrap_err();
        assert!(err.to_string().contains("does not match dim"));
    }
}
