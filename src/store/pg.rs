//! PostgreSQL-backed key-value store

use super::PersistentStore;
use crate::config::DatabaseConfig;
use crate::error::EngineResult;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Key-value store over a single Postgres table
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and ensure the schema exists
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_kv (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Store migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for PgStore {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM engine_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_kv (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!("Stored {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM engine_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        // LIKE pattern special characters in keys are escaped so a literal
        // prefix match is performed
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            "SELECT key, value FROM engine_kv WHERE key LIKE $1 ESCAPE '\\' ORDER BY key",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}
