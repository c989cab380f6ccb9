//! Postgres-backed store.
//!
//! One row per key in `node_state`. Versions come from a sequence so a key
//! that is deleted and re-created never repeats a version a stale reader
//! might still hold.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{Store, StoreKey, Versioned};
use crate::error::Result;

/// Store handle. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Health check, runs `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, key: StoreKey) -> Result<Option<Versioned>> {
        let row: Option<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT version, value FROM node_state WHERE key = $1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(version, value)| Versioned {
            version: version as u64,
            value,
        }))
    }

    async fn compare_and_swap(
        &self,
        key: StoreKey,
        expected: Option<u64>,
        value: Option<serde_json::Value>,
    ) -> Result<bool> {
        let rows_affected = match (expected, value) {
            (None, Some(value)) => sqlx::query(
                "INSERT INTO node_state (key, version, value)
                 VALUES ($1, nextval('node_state_version_seq'), $2)
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key.as_str())
            .bind(value)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(version), Some(value)) => sqlx::query(
                "UPDATE node_state
                 SET version = nextval('node_state_version_seq'), value = $2, updated_at = now()
                 WHERE key = $1 AND version = $3",
            )
            .bind(key.as_str())
            .bind(value)
            .bind(version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(version), None) => {
                sqlx::query("DELETE FROM node_state WHERE key = $1 AND version = $2")
                    .bind(key.as_str())
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            (None, None) => {
                // Deleting an absent key succeeds only if it is still absent.
                return Ok(self.get(key).await?.is_none());
            }
        };

        Ok(rows_affected == 1)
    }
}
