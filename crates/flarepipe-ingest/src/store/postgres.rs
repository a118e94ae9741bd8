//! PostgreSQL-backed document store
//!
//! All collections share one `documents` table keyed by `(collection, id)`
//! with the document body in a JSONB column. The schema is created by the
//! embedded migrations on connect.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::info;

use super::{DocumentStore, StoreConnector, UpsertOutcome};
use crate::config::DatabaseConfig;
use crate::error::StoreError;

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> Result<UpsertOutcome, StoreError> {
        // xmax is zero only for a freshly inserted row version
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO documents (collection, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO UPDATE
            SET body = EXCLUDED.body,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(document))
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        })
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE collection = $1 AND body @> $2",
        )
        .bind(collection)
        .bind(Json(filter))
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

/// Opens pooled connections and applies pending migrations
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: DatabaseConfig,
}

impl PgConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub async fn connect_pool(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .connect(&self.config.url)
            .await?;

        sqlx::migrate!("../../migrations").run(&pool).await?;

        info!(
            max_connections = self.config.max_connections,
            "Document store connection pool created"
        );
        Ok(pool)
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError> {
        Ok(Box::new(PgDocumentStore::new(self.connect_pool().await?)))
    }
}
