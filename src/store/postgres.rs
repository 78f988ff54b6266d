//! PostgreSQL matching store

use super::MatchingStore;
use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};
use crate::intents::{Intent, Match};
use crate::secret::Secret;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// Matching store for PostgreSQL persistence
///
/// Records are kept as JSONB next to a `version` column; every update is an
/// `UPDATE ... WHERE version = $expected`. The initiator's secret lives in its
/// own column and never enters the JSON document.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intents (
                id VARCHAR(64) PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                version BIGINT NOT NULL,
                secret VARCHAR(66),
                data JSONB NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status
            ON intents (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS matches (
                id VARCHAR(64) PRIMARY KEY,
                intent_id VARCHAR(64) NOT NULL REFERENCES intents (id) ON DELETE CASCADE,
                status VARCHAR(20) NOT NULL,
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_checkpoints (
                network VARCHAR(64) PRIMARY KEY,
                position BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn intent_from_row(row: &sqlx::postgres::PgRow) -> SwapResult<Intent> {
        let Json(mut intent): Json<Intent> = row.try_get("data")?;
        let secret: Option<String> = row.try_get("secret")?;
        intent.secret = secret
            .map(|s| Secret::from_hex(&s))
            .transpose()
            .map_err(|e| SwapError::Storage(format!("corrupt secret for intent {}: {}", intent.id, e)))?;
        Ok(intent)
    }

    fn match_from_row(row: &sqlx::postgres::PgRow) -> SwapResult<Match> {
        let Json(record): Json<Match> = row.try_get("data")?;
        Ok(record)
    }
}

#[async_trait]
impl MatchingStore for PostgresStore {
    async fn insert_intent(&self, intent: &Intent) -> SwapResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO intents (id, status, version, secret, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&intent.id)
        .bind(intent.status.as_str())
        .bind(intent.version as i64)
        .bind(intent.secret.as_ref().map(|s| s.expose_hex()))
        .bind(Json(intent))
        .bind(intent.created_at as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SwapError::StateConflict(format!(
                "intent {} already exists",
                intent.id
            )));
        }
        Ok(())
    }

    async fn get_intent(&self, id: &str) -> SwapResult<Option<Intent>> {
        let row = sqlx::query("SELECT data, secret FROM intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::intent_from_row).transpose()
    }

    async fn list_intents(&self) -> SwapResult<Vec<Intent>> {
        let rows = sqlx::query("SELECT data, secret FROM intents ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::intent_from_row).collect()
    }

    async fn compare_and_swap_intent(&self, expected_version: u64, intent: &Intent) -> SwapResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE intents
            SET status = $1, version = $2, data = $3, updated_at = NOW()
            WHERE id = $4 AND version = $5
            "#,
        )
        .bind(intent.status.as_str())
        .bind(intent.version as i64)
        .bind(Json(intent))
        .bind(&intent.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit_match(
        &self,
        expected_intent_version: u64,
        intent: &Intent,
        record: &Match,
    ) -> SwapResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE intents
            SET status = $1, version = $2, data = $3, updated_at = NOW()
            WHERE id = $4 AND version = $5
            "#,
        )
        .bind(intent.status.as_str())
        .bind(intent.version as i64)
        .bind(Json(intent))
        .bind(&intent.id)
        .bind(expected_intent_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO matches (id, intent_id, status, version, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.id)
        .bind(&record.intent_id)
        .bind(record.status.as_str())
        .bind(record.version as i64)
        .bind(Json(record))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Committed match {} for intent {}", record.id, intent.id);
        Ok(true)
    }

    async fn get_match(&self, id: &str) -> SwapResult<Option<Match>> {
        let row = sqlx::query("SELECT data FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::match_from_row).transpose()
    }

    async fn list_matches(&self) -> SwapResult<Vec<Match>> {
        let rows = sqlx::query("SELECT data FROM matches")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::match_from_row).collect()
    }

    async fn compare_and_swap_match(&self, expected_version: u64, record: &Match) -> SwapResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE matches
            SET status = $1, version = $2, data = $3, updated_at = NOW()
            WHERE id = $4 AND version = $5
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.version as i64)
        .bind(Json(record))
        .bind(&record.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear(&self) -> SwapResult<(usize, usize)> {
        let mut tx = self.pool.begin().await?;
        let matches = sqlx::query("DELETE FROM matches").execute(&mut *tx).await?;
        let intents = sqlx::query("DELETE FROM intents").execute(&mut *tx).await?;
        tx.commit().await?;

        Ok((intents.rows_affected() as usize, matches.rows_affected() as usize))
    }

    async fn get_checkpoint(&self, network: &str) -> SwapResult<Option<u64>> {
        let row = sqlx::query("SELECT position FROM ledger_checkpoints WHERE network = $1")
            .bind(network)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("position") as u64))
    }

    async fn save_checkpoint(&self, network: &str, cursor: u64) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_checkpoints (network, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (network)
            DO UPDATE SET position = $2, updated_at = NOW()
            "#,
        )
        .bind(network)
        .bind(cursor as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: {}", network, cursor);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
