//! `PostgreSQL` order store.
//!
//! The aggregate is persisted as a JSONB document plus indexed columns for
//! the queries the pipeline needs: per-user listing, sweep scans, and
//! gateway-reference lookup. Gateway references live in a side table whose
//! primary key makes each reference globally unique — a second order can
//! never claim a reference already recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinema_core::{CheckoutError, GatewayRef, Order, OrderId, OrderStore, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::config::StoreConfig;

/// Schema applied by [`PostgresOrderStore::ensure_schema`]. Idempotent.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS orders (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL,
    body JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS orders_user_idx
    ON orders (user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS orders_pending_idx
    ON orders (created_at) WHERE status = 'pending_payment';

CREATE TABLE IF NOT EXISTS order_gateway_references (
    reference TEXT PRIMARY KEY,
    order_id UUID NOT NULL REFERENCES orders (id),
    intent_status TEXT NOT NULL,
    intent_created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS gateway_refs_stale_idx
    ON order_gateway_references (intent_created_at)
    WHERE intent_status IN ('created', 'authorized');
";

/// `PostgreSQL`-backed [`OrderStore`].
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Connects a pool per the store configuration.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] if the pool cannot connect.
    pub async fn connect(config: &StoreConfig) -> Result<Self, CheckoutError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect(&config.url)
            .await
            .map_err(store_err)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Safe to run at every startup.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::StoreUnavailable`] on database failure.
    pub async fn ensure_schema(&self) -> Result<(), CheckoutError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Upserts the gateway-reference index rows for an order's intents.
    async fn sync_reference_index(
        order: &Order,
        conn: &mut sqlx::PgConnection,
    ) -> Result<(), CheckoutError> {
        for intent in order.intents() {
            let Some(reference) = &intent.gateway_reference else {
                continue;
            };
            let result = sqlx::query(
                r"
                INSERT INTO order_gateway_references
                    (reference, order_id, intent_status, intent_created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (reference) DO UPDATE
                    SET intent_status = EXCLUDED.intent_status
                    WHERE order_gateway_references.order_id = EXCLUDED.order_id
                ",
            )
            .bind(reference.as_str())
            .bind(order.id().as_uuid())
            .bind(intent.status.to_string())
            .bind(intent.created_at)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
            // Zero rows means the guarded upsert matched a row owned by a
            // different order: the reference is already claimed.
            if result.rows_affected() == 0 {
                return Err(CheckoutError::SettlementConflict {
                    order: order.id(),
                    detail: format!(
                        "gateway reference {reference} is already recorded for another order"
                    ),
                });
            }
        }
        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> CheckoutError {
    CheckoutError::StoreUnavailable {
        detail: err.to_string(),
    }
}

fn decode_order(row: &sqlx::postgres::PgRow) -> Result<Order, CheckoutError> {
    let body: serde_json::Value = row.try_get("body").map_err(store_err)?;
    let version: i64 = row.try_get("version").map_err(store_err)?;
    let mut order: Order =
        serde_json::from_value(body).map_err(|e| CheckoutError::StoreUnavailable {
            detail: format!("corrupt order document: {e}"),
        })?;
    order.set_version(u64::try_from(version).unwrap_or(0));
    Ok(order)
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), CheckoutError> {
        let body = serde_json::to_value(order).map_err(|e| CheckoutError::StoreUnavailable {
            detail: format!("serialize order: {e}"),
        })?;
        sqlx::query(
            r"
            INSERT INTO orders (id, user_id, status, created_at, version, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(order.id().as_uuid())
        .bind(order.user_id().as_uuid())
        .bind(order.status().to_string())
        .bind(order.created_at())
        .bind(i64::try_from(order.version()).unwrap_or(i64::MAX))
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load(&self, id: OrderId) -> Result<Option<Order>, CheckoutError> {
        let row = sqlx::query(r"SELECT body, version FROM orders WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode_order).transpose()
    }

    async fn update(&self, order: &Order, expected_version: u64) -> Result<u64, CheckoutError> {
        let new_version = expected_version + 1;
        let body = serde_json::to_value(order).map_err(|e| CheckoutError::StoreUnavailable {
            detail: format!("serialize order: {e}"),
        })?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = $2, version = $3, body = $4
            WHERE id = $1 AND version = $5
            ",
        )
        .bind(order.id().as_uuid())
        .bind(order.status().to_string())
        .bind(i64::try_from(new_version).unwrap_or(i64::MAX))
        .bind(body)
        .bind(i64::try_from(expected_version).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(store_err)?;
            return Err(CheckoutError::ConcurrentModification { order: order.id() });
        }

        Self::sync_reference_index(order, &mut *tx).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(new_version)
    }

    async fn find_by_gateway_reference(
        &self,
        reference: &GatewayRef,
    ) -> Result<Option<Order>, CheckoutError> {
        let row = sqlx::query(
            r"
            SELECT o.body, o.version
            FROM orders o
            JOIN order_gateway_references r ON r.order_id = o.id
            WHERE r.reference = $1
            ",
        )
        .bind(reference.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(decode_order).transpose()
    }

    async fn find_by_user(&self, user: UserId) -> Result<Vec<Order>, CheckoutError> {
        let rows = sqlx::query(
            r"
            SELECT body, version FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC
            ",
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(decode_order).collect()
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>, CheckoutError> {
        let rows = sqlx::query(
            r"
            SELECT body, version FROM orders
            WHERE status = 'pending_payment' AND created_at < $1
            ORDER BY created_at
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(decode_order).collect()
    }

    async fn stale_intent_references(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(OrderId, GatewayRef)>, CheckoutError> {
        let rows = sqlx::query(
            r"
            SELECT order_id, reference FROM order_gateway_references
            WHERE intent_status IN ('created', 'authorized')
              AND intent_created_at < $1
            ORDER BY intent_created_at
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|row| {
                let order_id: uuid::Uuid = row.try_get("order_id").map_err(store_err)?;
                let reference: String = row.try_get("reference").map_err(store_err)?;
                Ok((OrderId::from_uuid(order_id), GatewayRef::new(reference)))
            })
            .collect()
    }
}
