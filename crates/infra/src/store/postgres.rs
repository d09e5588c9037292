//! Postgres-backed order/ledger store.
//!
//! ## Atomic credit
//!
//! `update_order` runs a conditional `UPDATE orders ... WHERE status = ANY(<legal
//! predecessors>)` and, only when that changed a row into `PROCESSED`, credits
//! the owner's balance in the same transaction. A repeated terminal write finds
//! no legal predecessor, changes zero rows, and credits nothing.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | caller-specific (`DuplicateLogin`, ...) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use loyalty_core::{Balance, Order, OrderNumber, OrderStatus, Points, UserId, Withdrawal};

use super::r#trait::{LedgerStore, OrderStore, OrderUpdate, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id          UUID PRIMARY KEY,
        login       TEXT NOT NULL UNIQUE,
        balance     BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
        withdrawn   BIGINT NOT NULL DEFAULT 0 CHECK (withdrawn >= 0),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        number       TEXT PRIMARY KEY,
        owner_id     UUID NOT NULL REFERENCES users(id),
        status       TEXT NOT NULL DEFAULT 'NEW'
                     CHECK (status IN ('NEW', 'PROCESSING', 'INVALID', 'PROCESSED')),
        accrual      BIGINT CHECK (accrual >= 0),
        uploaded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_unreconciled_idx
        ON orders (uploaded_at)
        WHERE status IN ('NEW', 'PROCESSING')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        order_number  TEXT NOT NULL,
        owner_id      UUID NOT NULL REFERENCES users(id),
        sum           BIGINT NOT NULL CHECK (sum > 0),
        processed_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Postgres-backed store.
///
/// ## Thread Safety
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync), so one
/// instance can be shared by every reconciliation worker.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Arc<PgPool>,
}

impl PostgresOrderStore {
    /// Create a new PostgresOrderStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[instrument(skip(self), fields(order_count = tracing::field::Empty), err)]
    async fn fetch_unreconciled_orders(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT number, owner_id, status, accrual, uploaded_at
            FROM orders
            WHERE status NOT IN ('PROCESSED', 'INVALID')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unreconciled_orders", e))?;

        let orders = rows
            .iter()
            .map(order_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("order_count", orders.len());
        Ok(orders)
    }

    #[instrument(
        skip(self, update),
        fields(order = %update.number, status = %update.status),
        err
    )]
    async fn update_order(&self, update: OrderUpdate) -> Result<u64, StoreError> {
        let predecessors: Vec<String> = update
            .status
            .predecessors()
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update_order.begin", e))?;

        let changed = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2,
                accrual = COALESCE($3, accrual)
            WHERE number = $1
                AND status = ANY($4)
                AND ($5::uuid IS NULL OR owner_id = $5)
            RETURNING owner_id
            "#,
        )
        .bind(update.number.as_str())
        .bind(update.status.as_str())
        .bind(update.accrual.map(Points::minor))
        .bind(predecessors)
        .bind(update.owner.map(|o| *o.as_uuid()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        let Some(row) = changed else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("update_order.rollback", e))?;
            return Ok(0);
        };

        let owner: uuid::Uuid = row
            .try_get("owner_id")
            .map_err(|e| map_sqlx_error("update_order.owner_id", e))?;

        let credit = update.credit();
        if !credit.is_zero() {
            sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
                .bind(owner)
                .bind(credit.minor())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_order.credit", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update_order.commit", e))?;
        Ok(1)
    }
}

#[async_trait]
impl LedgerStore for PostgresOrderStore {
    #[instrument(skip(self), err)]
    async fn register_user(&self, login: &str) -> Result<UserId, StoreError> {
        let id = UserId::new();
        sqlx::query("INSERT INTO users (id, login) VALUES ($1, $2)")
            .bind(id.as_uuid())
            .bind(login)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateLogin(login.to_string())
                } else {
                    map_sqlx_error("register_user", e)
                }
            })?;
        Ok(id)
    }

    #[instrument(skip(self), fields(order = %number, owner = %owner), err)]
    async fn put_order(&self, number: OrderNumber, owner: UserId) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (number, owner_id, status)
            VALUES ($1, $2, 'NEW')
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(number.as_str())
        .bind(owner.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_order", e))?
        .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        let row = sqlx::query("SELECT owner_id FROM orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("put_order.owner", e))?;
        let existing: uuid::Uuid = row
            .try_get("owner_id")
            .map_err(|e| map_sqlx_error("put_order.owner_id", e))?;

        if existing == *owner.as_uuid() {
            Err(StoreError::AlreadySubmitted(number))
        } else {
            Err(StoreError::OwnedByAnotherUser(number))
        }
    }

    #[instrument(skip(self), err)]
    async fn user_orders(&self, owner: UserId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT number, owner_id, status, accrual, uploaded_at
            FROM orders
            WHERE owner_id = $1
            ORDER BY uploaded_at ASC
            "#,
        )
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("user_orders", e))?;

        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn balance(&self, owner: UserId) -> Result<Balance, StoreError> {
        let row = sqlx::query("SELECT balance, withdrawn FROM users WHERE id = $1")
            .bind(owner.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?
            .ok_or(StoreError::UnknownUser(owner))?;

        Ok(Balance {
            current: points_column(&row, "balance")?,
            withdrawn: points_column(&row, "withdrawn")?,
        })
    }

    #[instrument(skip(self), fields(order = %order), err)]
    async fn withdraw(
        &self,
        owner: UserId,
        order: OrderNumber,
        sum: Points,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("withdraw.begin", e))?;

        let debited = sqlx::query(
            r#"
            UPDATE users
            SET balance = balance - $2,
                withdrawn = withdrawn + $2
            WHERE id = $1 AND balance >= $2
            "#,
        )
        .bind(owner.as_uuid())
        .bind(sum.minor())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("withdraw.debit", e))?
        .rows_affected();

        if debited == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("withdraw.rollback", e))?;
            return Err(StoreError::InsufficientFunds);
        }

        sqlx::query("INSERT INTO withdrawals (order_number, owner_id, sum) VALUES ($1, $2, $3)")
            .bind(order.as_str())
            .bind(owner.as_uuid())
            .bind(sum.minor())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("withdraw.insert", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("withdraw.commit", e))
    }

    #[instrument(skip(self), err)]
    async fn withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, sum, processed_at
            FROM withdrawals
            WHERE owner_id = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("withdrawals", e))?;

        rows.iter()
            .map(|row| {
                let order: String = row
                    .try_get("order_number")
                    .map_err(|e| map_sqlx_error("withdrawals.row", e))?;
                let processed_at: DateTime<Utc> = row
                    .try_get("processed_at")
                    .map_err(|e| map_sqlx_error("withdrawals.row", e))?;
                Ok(Withdrawal {
                    order: OrderNumber::new(order),
                    sum: points_column(row, "sum")?,
                    processed_at,
                })
            })
            .collect()
    }
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
    let number: String = row
        .try_get("number")
        .map_err(|e| map_sqlx_error("order_row", e))?;
    let owner: uuid::Uuid = row
        .try_get("owner_id")
        .map_err(|e| map_sqlx_error("order_row", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("order_row", e))?;
    let accrual: Option<i64> = row
        .try_get("accrual")
        .map_err(|e| map_sqlx_error("order_row", e))?;
    let uploaded_at: DateTime<Utc> = row
        .try_get("uploaded_at")
        .map_err(|e| map_sqlx_error("order_row", e))?;

    Ok(Order {
        number: OrderNumber::new(number),
        owner: UserId::from_uuid(owner),
        status: status.parse::<OrderStatus>()?,
        accrual: accrual.map(Points::from_minor).transpose()?,
        uploaded_at,
    })
}

fn points_column(row: &sqlx::postgres::PgRow, column: &str) -> Result<Points, StoreError> {
    let minor: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error(column, e))?;
    Ok(Points::from_minor(minor)?)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
