//! PostgreSQL-backed store
//!
//! The watermark is one row in `feed_watermarks`, keyed by the configured
//! watermark key. Documents are appended to `feed_documents` under the list
//! key. A commit writes both in one transaction; the watermark write is
//! guarded by the revision the caller read, and a guard miss rolls the whole
//! transaction back.

use async_trait::async_trait;
use feedsync_common::types::{FetchResult, Watermark};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::ArchiveStore;
use crate::config::StoreConfig;
use crate::error::{CommitError, ConflictError, StoreError};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

impl PostgresStore {
    pub fn new(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    pub async fn connect(database_url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect(database_url)
            .await?;

        info!(max_connections = MAX_CONNECTIONS, "Database connection pool created");
        Ok(Self::new(pool, config))
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Moves the watermark forward if it is still at `expected`.
    ///
    /// Returns false when the guard did not match.
    async fn advance_watermark(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        expected: &Watermark,
        key: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = if expected.revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO feed_watermarks (watermark_key, archive_key, revision)
                VALUES ($1, $2, 1)
                ON CONFLICT (watermark_key) DO NOTHING
                "#,
            )
            .bind(&self.config.watermark_key)
            .bind(key)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE feed_watermarks
                SET archive_key = $2, revision = revision + 1, updated_at = NOW()
                WHERE watermark_key = $1 AND revision = $3
                "#,
            )
            .bind(&self.config.watermark_key)
            .bind(key)
            .bind(expected.revision)
            .execute(&mut **tx)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn append_documents(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        result: &FetchResult,
    ) -> Result<u64, sqlx::Error> {
        if result.records.is_empty() {
            return Ok(0);
        }

        let positions: Vec<i32> = (0..result.records.len() as i32).collect();
        let inserted = sqlx::query(
            r#"
            INSERT INTO feed_documents (list_key, archive_key, position, body)
            SELECT $1, $2, t.position, t.body
            FROM UNNEST($3::int4[], $4::text[]) AS t(position, body)
            "#,
        )
        .bind(&self.config.list_key)
        .bind(&result.key)
        .bind(&positions)
        .bind(&result.records)
        .execute(&mut **tx)
        .await?;

        Ok(inserted.rows_affected())
    }

    async fn current_revision(&self) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT revision FROM feed_watermarks WHERE watermark_key = $1")
            .bind(&self.config.watermark_key)
            .fetch_optional(&self.pool)
            .await
    }
}

fn db_error(e: sqlx::Error) -> CommitError {
    CommitError::Store(StoreError::Database(e))
}

#[async_trait]
impl ArchiveStore for PostgresStore {
    async fn load_watermark(&self) -> Result<Watermark, StoreError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT archive_key, revision FROM feed_watermarks WHERE watermark_key = $1",
        )
        .bind(&self.config.watermark_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((key, revision)) => Watermark::at(key, revision),
            None => Watermark::empty(),
        })
    }

    #[instrument(skip(self, result), fields(archive = %result.key))]
    async fn commit(
        &self,
        expected: &Watermark,
        result: &FetchResult,
    ) -> Result<Watermark, CommitError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if !self
            .advance_watermark(&mut tx, expected, &result.key)
            .await
            .map_err(db_error)?
        {
            tx.rollback().await.map_err(db_error)?;
            let found_revision = self.current_revision().await.map_err(db_error)?;
            return Err(ConflictError {
                watermark_key: self.config.watermark_key.clone(),
                expected_revision: expected.revision,
                found_revision,
            }
            .into());
        }

        let inserted = self
            .append_documents(&mut tx, result)
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        debug!(archive = %result.key, documents = inserted, "Committed archive");
        Ok(expected.advance(result.key.clone()))
    }

    async fn document_count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_documents WHERE list_key = $1")
                .bind(&self.config.list_key)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}
