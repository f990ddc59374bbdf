//! PostgreSQL order store
//!
//! Orders are kept as JSONB documents next to the indexed columns the
//! conditional update keys on. Amounts are `u128`, so records travel as
//! JSON text rather than `serde_json::Value`.

use super::OrderStore;
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::{Order, OrderHash, OrderPhase, PreparedOrder};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

fn encode<T: serde::Serialize>(value: &T) -> CoordinatorResult<String> {
    serde_json::to_string(value).map_err(|e| CoordinatorError::Internal(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(record: &str) -> CoordinatorResult<T> {
    serde_json::from_str(record)
        .map_err(|e| CoordinatorError::Internal(format!("corrupt stored record: {}", e)))
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_hash VARCHAR(66) PRIMARY KEY,
                phase VARCHAR(32) NOT NULL,
                version BIGINT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_phase
            ON orders (phase)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prepared_orders (
                id UUID PRIMARY KEY,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn get_order(&self, order_hash: &OrderHash) -> CoordinatorResult<Option<Order>> {
        let row = sqlx::query("SELECT record::text AS record FROM orders WHERE order_hash = $1")
            .bind(order_hash.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode(&r.get::<String, _>("record"))).transpose()
    }

    async fn insert_order(&self, order: &Order) -> CoordinatorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (order_hash, phase, version, record)
            VALUES ($1, $2, $3, $4::jsonb)
            ON CONFLICT (order_hash) DO NOTHING
            "#,
        )
        .bind(order.order_hash.to_string())
        .bind(order.phase.as_str())
        .bind(order.version as i64)
        .bind(encode(order)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::DuplicateOrder {
                order_hash: order.order_hash.to_string(),
            });
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_phase: OrderPhase,
        expected_version: u64,
        order: &Order,
    ) -> CoordinatorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET phase = $1, version = $2, record = $3::jsonb, updated_at = NOW()
            WHERE order_hash = $4 AND phase = $5 AND version = $6
            "#,
        )
        .bind(order.phase.as_str())
        .bind(order.version as i64)
        .bind(encode(order)?)
        .bind(order.order_hash.to_string())
        .bind(expected_phase.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        debug!(
            "CAS on order {} ({} v{} -> {} v{}): {}",
            order.order_hash,
            expected_phase,
            expected_version,
            order.phase,
            order.version,
            applied
        );
        Ok(applied)
    }

    async fn list_by_phase(&self, phase: OrderPhase) -> CoordinatorResult<Vec<Order>> {
        let rows = sqlx::query("SELECT record::text AS record FROM orders WHERE phase = $1")
            .bind(phase.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| decode(&r.get::<String, _>("record")))
            .collect()
    }

    async fn stage_prepared(&self, prepared: &PreparedOrder) -> CoordinatorResult<()> {
        sqlx::query("INSERT INTO prepared_orders (id, record) VALUES ($1, $2::jsonb)")
            .bind(prepared.id)
            .bind(encode(prepared)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_prepared(&self, id: &Uuid) -> CoordinatorResult<Option<PreparedOrder>> {
        let row = sqlx::query(
            "DELETE FROM prepared_orders WHERE id = $1 RETURNING record::text AS record",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode(&r.get::<String, _>("record"))).transpose()
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
