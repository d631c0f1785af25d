//! PostgreSQL database client implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, types::Json};
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, Asset, DatabaseClient, DatabaseError, FeeMetadata, FeeStatus, FeeTransaction, Money,
    PaginatedResponse, Ratio, SettlementError, ValidationError,
};

const FEE_TRANSACTION_COLUMNS: &str = r#"
    id, user_id, trade_id, trade_amount, fee_amount, fee_rate, fee_tier, status,
    ledger_tx_hash, asset_code, asset_issuer, destination_address, failure_reason,
    retry_count, next_retry_at, last_attempt_at, metadata, version,
    created_at, updated_at, collected_at, refunded_at
"#;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL database client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Apply pending migrations from `./migrations`
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_fee_transaction(row: &sqlx::postgres::PgRow) -> Result<FeeTransaction, AppError> {
        let corrupt = |field: &str, message: String| {
            AppError::Database(DatabaseError::Query(format!(
                "corrupt fee_transactions.{field}: {message}"
            )))
        };

        let trade_amount: Decimal = row.try_get("trade_amount").map_err(DatabaseError::from)?;
        let fee_amount: Decimal = row.try_get("fee_amount").map_err(DatabaseError::from)?;
        let fee_rate: Decimal = row.try_get("fee_rate").map_err(DatabaseError::from)?;
        let fee_tier: String = row.try_get("fee_tier").map_err(DatabaseError::from)?;
        let status: String = row.try_get("status").map_err(DatabaseError::from)?;
        let Json(metadata): Json<FeeMetadata> =
            row.try_get("metadata").map_err(DatabaseError::from)?;

        Ok(FeeTransaction {
            id: row.try_get("id").map_err(DatabaseError::from)?,
            user_id: row.try_get("user_id").map_err(DatabaseError::from)?,
            trade_id: row.try_get("trade_id").map_err(DatabaseError::from)?,
            trade_amount: Money::from_decimal(trade_amount)
                .map_err(|e| corrupt("trade_amount", e.to_string()))?,
            fee_amount: Money::from_decimal(fee_amount)
                .map_err(|e| corrupt("fee_amount", e.to_string()))?,
            fee_rate: Ratio::from_decimal(fee_rate)
                .map_err(|e| corrupt("fee_rate", e.to_string()))?,
            fee_tier: fee_tier.parse().map_err(|e| corrupt("fee_tier", e))?,
            status: status.parse().map_err(|e| corrupt("status", e))?,
            ledger_tx_hash: row.try_get("ledger_tx_hash").map_err(DatabaseError::from)?,
            asset: Asset {
                asset_code: row.try_get("asset_code").map_err(DatabaseError::from)?,
                asset_issuer: row.try_get("asset_issuer").map_err(DatabaseError::from)?,
            },
            destination_address: row
                .try_get("destination_address")
                .map_err(DatabaseError::from)?,
            failure_reason: row.try_get("failure_reason").map_err(DatabaseError::from)?,
            retry_count: row.try_get("retry_count").map_err(DatabaseError::from)?,
            next_retry_at: row.try_get("next_retry_at").map_err(DatabaseError::from)?,
            last_attempt_at: row.try_get("last_attempt_at").map_err(DatabaseError::from)?,
            metadata,
            version: row.try_get("version").map_err(DatabaseError::from)?,
            created_at: row.try_get("created_at").map_err(DatabaseError::from)?,
            updated_at: row.try_get("updated_at").map_err(DatabaseError::from)?,
            collected_at: row.try_get("collected_at").map_err(DatabaseError::from)?,
            refunded_at: row.try_get("refunded_at").map_err(DatabaseError::from)?,
        })
    }

    fn rows_to_fee_transactions(
        rows: &[sqlx::postgres::PgRow],
    ) -> Result<Vec<FeeTransaction>, AppError> {
        rows.iter().map(Self::row_to_fee_transaction).collect()
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(id = %tx.id, user_id = %tx.user_id))]
    async fn insert_fee_transaction(
        &self,
        tx: &FeeTransaction,
    ) -> Result<FeeTransaction, AppError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO fee_transactions (
                id, user_id, trade_id, trade_amount, fee_amount, fee_rate, fee_tier, status,
                ledger_tx_hash, asset_code, asset_issuer, destination_address, failure_reason,
                retry_count, next_retry_at, last_attempt_at, metadata, version,
                created_at, updated_at, collected_at, refunded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            RETURNING {FEE_TRANSACTION_COLUMNS}
            "#
        ))
        .bind(&tx.id)
        .bind(&tx.user_id)
        .bind(&tx.trade_id)
        .bind(tx.trade_amount.as_decimal())
        .bind(tx.fee_amount.as_decimal())
        .bind(tx.fee_rate.as_decimal())
        .bind(tx.fee_tier.as_str())
        .bind(tx.status.as_str())
        .bind(&tx.ledger_tx_hash)
        .bind(&tx.asset.asset_code)
        .bind(&tx.asset.asset_issuer)
        .bind(&tx.destination_address)
        .bind(&tx.failure_reason)
        .bind(tx.retry_count)
        .bind(tx.next_retry_at)
        .bind(tx.last_attempt_at)
        .bind(Json(&tx.metadata))
        .bind(tx.version)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.collected_at)
        .bind(tx.refunded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Self::row_to_fee_transaction(&row)
    }

    #[instrument(skip(self))]
    async fn get_fee_transaction(&self, id: &str) -> Result<Option<FeeTransaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {FEE_TRANSACTION_COLUMNS} FROM fee_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_fee_transaction).transpose()
    }

    #[instrument(skip(self))]
    async fn get_fee_transaction_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<FeeTransaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {FEE_TRANSACTION_COLUMNS} FROM fee_transactions WHERE trade_id = $1"
        ))
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_fee_transaction).transpose()
    }

    #[instrument(skip(self, tx), fields(id = %tx.id, status = %tx.status, version = tx.version))]
    async fn update_fee_transaction(
        &self,
        tx: &FeeTransaction,
    ) -> Result<FeeTransaction, AppError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE fee_transactions
            SET status = $3,
                ledger_tx_hash = $4,
                failure_reason = $5,
                retry_count = $6,
                next_retry_at = $7,
                last_attempt_at = $8,
                fee_amount = $9,
                metadata = $10,
                updated_at = $11,
                collected_at = $12,
                refunded_at = $13,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {FEE_TRANSACTION_COLUMNS}
            "#
        ))
        .bind(&tx.id)
        .bind(tx.version)
        .bind(tx.status.as_str())
        .bind(&tx.ledger_tx_hash)
        .bind(&tx.failure_reason)
        .bind(tx.retry_count)
        .bind(tx.next_retry_at)
        .bind(tx.last_attempt_at)
        .bind(tx.fee_amount.as_decimal())
        .bind(Json(&tx.metadata))
        .bind(tx.updated_at)
        .bind(tx.collected_at)
        .bind(tx.refunded_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if let Some(row) = row {
            return Self::row_to_fee_transaction(&row);
        }

        // No row matched: either the id is unknown or another writer got there first
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM fee_transactions WHERE id = $1)")
                .bind(&tx.id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if exists {
            Err(AppError::Settlement(
                SettlementError::ConcurrentModification(tx.id.clone()),
            ))
        } else {
            Err(AppError::Database(DatabaseError::NotFound(tx.id.clone())))
        }
    }

    #[instrument(skip(self))]
    async fn list_fee_transactions(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<FeeTransaction>, AppError> {
        let limit = limit.clamp(1, 100);
        let fetch_limit = limit + 1;

        let rows = match cursor {
            Some(cursor_id) => {
                let cursor_row =
                    sqlx::query("SELECT created_at FROM fee_transactions WHERE id = $1")
                        .bind(cursor_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

                let cursor_created_at: DateTime<Utc> = match cursor_row {
                    Some(row) => row.get("created_at"),
                    None => {
                        return Err(AppError::Validation(ValidationError::InvalidField {
                            field: "cursor".to_string(),
                            message: "Invalid cursor".to_string(),
                        }));
                    }
                };

                sqlx::query(&format!(
                    r#"
                    SELECT {FEE_TRANSACTION_COLUMNS}
                    FROM fee_transactions
                    WHERE (created_at, id) < ($1, $2)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $3
                    "#
                ))
                .bind(cursor_created_at)
                .bind(cursor_id)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?
            }
            None => sqlx::query(&format!(
                r#"
                    SELECT {FEE_TRANSACTION_COLUMNS}
                    FROM fee_transactions
                    ORDER BY created_at DESC, id DESC
                    LIMIT $1
                    "#
            ))
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?,
        };

        let has_more = rows.len() > limit as usize;
        let items: Vec<FeeTransaction> = rows
            .iter()
            .take(limit as usize)
            .map(Self::row_to_fee_transaction)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if has_more {
            items.last().map(|tx| tx.id.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(items, next_cursor, has_more))
    }

    #[instrument(skip(self))]
    async fn find_by_status(
        &self,
        status: FeeStatus,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FEE_TRANSACTION_COLUMNS}
            FROM fee_transactions
            WHERE status = $1 AND created_at < $2
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(created_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::rows_to_fee_transactions(&rows)
    }

    #[instrument(skip(self))]
    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FEE_TRANSACTION_COLUMNS}
            FROM fee_transactions
            WHERE status = 'FAILED'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::rows_to_fee_transactions(&rows)
    }

    #[instrument(skip(self))]
    async fn find_unchecked_failures(
        &self,
        attempted_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeeTransaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FEE_TRANSACTION_COLUMNS}
            FROM fee_transactions
            WHERE status = 'FAILED'
              AND next_retry_at IS NULL
              AND last_attempt_at IS NOT NULL
              AND last_attempt_at < $1
            ORDER BY last_attempt_at ASC
            LIMIT $2
            "#
        ))
        .bind(attempted_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::rows_to_fee_transactions(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_column_list_covers_every_field() {
        let columns: Vec<&str> = FEE_TRANSACTION_COLUMNS
            .split(',')
            .map(str::trim)
            .collect();
        assert_eq!(columns.len(), 22);
        for column in ["version", "metadata", "next_retry_at", "refunded_at"] {
            assert!(columns.contains(&column), "missing {column}");
        }
    }
}
