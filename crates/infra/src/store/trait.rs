use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use loyalty_core::{Balance, DomainError, Order, OrderNumber, OrderStatus, Points, UserId, Withdrawal};

/// A status change requested by the reconciliation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub number: OrderNumber,
    /// When set, the update only applies if the stored owner matches.
    pub owner: Option<UserId>,
    pub status: OrderStatus,
    pub accrual: Option<Points>,
}

impl OrderUpdate {
    /// `NEW -> PROCESSING` marker written before the accrual service is queried.
    pub fn processing(number: OrderNumber) -> Self {
        Self {
            number,
            owner: None,
            status: OrderStatus::Processing,
            accrual: None,
        }
    }

    /// Final status reported by the accrual service.
    pub fn finalize(
        number: OrderNumber,
        owner: UserId,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Self {
        Self {
            number,
            owner: Some(owner),
            status,
            accrual,
        }
    }

    /// Amount to credit when this update moves the order into `PROCESSED`.
    pub fn credit(&self) -> Points {
        match self.status {
            OrderStatus::Processed => self.accrual.unwrap_or(Points::ZERO),
            _ => Points::ZERO,
        }
    }
}

/// Storage operation error.
///
/// These are **infrastructure errors** plus the submission/withdrawal
/// outcomes the API maps to distinct responses.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("login already registered: {0}")]
    DuplicateLogin(String),

    #[error("order {0} was already submitted by this user")]
    AlreadySubmitted(OrderNumber),

    #[error("order {0} was already submitted by another user")]
    OwnedByAnotherUser(OrderNumber),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Orders capability consumed by the reconciliation pipeline.
///
/// Implementations must be safe for concurrent use by many workers. The
/// pipeline performs no locking of its own; `update_order` is the single
/// authoritative update path and must apply the balance credit for a
/// `PROCESSED` transition exactly once.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// All orders whose status is not terminal, oldest first.
    async fn fetch_unreconciled_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Apply a forward status transition; returns the number of rows changed.
    ///
    /// Returns `Ok(0)` (no-op) when the order is unknown, already terminal,
    /// already in the requested status, or owned by someone else.
    async fn update_order(&self, update: OrderUpdate) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    async fn fetch_unreconciled_orders(&self) -> Result<Vec<Order>, StoreError> {
        (**self).fetch_unreconciled_orders().await
    }

    async fn update_order(&self, update: OrderUpdate) -> Result<u64, StoreError> {
        (**self).update_order(update).await
    }
}

/// User-facing ledger operations (order submission, balance, withdrawals).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn register_user(&self, login: &str) -> Result<UserId, StoreError>;

    /// Submit an order in `NEW`. The first submitter owns it.
    async fn put_order(&self, number: OrderNumber, owner: UserId) -> Result<(), StoreError>;

    async fn user_orders(&self, owner: UserId) -> Result<Vec<Order>, StoreError>;

    async fn balance(&self, owner: UserId) -> Result<Balance, StoreError>;

    async fn withdraw(&self, owner: UserId, order: OrderNumber, sum: Points)
    -> Result<(), StoreError>;

    async fn withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_processed_updates_carry_credit() {
        let owner = UserId::new();
        let n = OrderNumber::new("79927398713");

        let processed =
            OrderUpdate::finalize(n.clone(), owner, OrderStatus::Processed, Some(Points::whole(500)));
        assert_eq!(processed.credit(), Points::whole(500));

        let invalid =
            OrderUpdate::finalize(n.clone(), owner, OrderStatus::Invalid, Some(Points::whole(500)));
        assert_eq!(invalid.credit(), Points::ZERO);

        assert_eq!(OrderUpdate::processing(n).credit(), Points::ZERO);
    }
}
