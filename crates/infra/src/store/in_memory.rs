use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use loyalty_core::{Balance, Order, OrderNumber, Points, UserId, Withdrawal};

use super::r#trait::{LedgerStore, OrderStore, OrderUpdate, StoreError};

#[derive(Debug, Default)]
struct UserRecord {
    login: String,
    balance: Balance,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, UserRecord>,
    orders: HashMap<OrderNumber, Order>,
    /// Insertion order, which is also `uploaded_at` order.
    order_index: Vec<OrderNumber>,
    withdrawals: Vec<(UserId, Withdrawal)>,
}

/// In-memory order/ledger store for tests/dev.
///
/// All mutations happen under one write lock, so a status transition and its
/// balance credit are applied atomically. Faults can be injected to exercise
/// the pipeline's transient-failure paths.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    inner: RwLock<State>,
    failing_fetches: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `fetch_unreconciled_orders` fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `update_order` fail.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Snapshot of a single order.
    pub fn order(&self, number: &OrderNumber) -> Option<Order> {
        self.read().ok()?.orders.get(number).cloned()
    }

    /// Seed an order as-is (any status), bypassing submission rules.
    pub fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.users.contains_key(&order.owner) {
            return Err(StoreError::UnknownUser(order.owner));
        }
        if !state.orders.contains_key(&order.number) {
            state.order_index.push(order.number.clone());
        }
        state.orders.insert(order.number.clone(), order);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

/// Consume one injected fault, if any are pending.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn fetch_unreconciled_orders(&self) -> Result<Vec<Order>, StoreError> {
        if take_fault(&self.failing_fetches) {
            return Err(StoreError::Unavailable("injected fetch failure".to_string()));
        }

        let state = self.read()?;
        Ok(state
            .order_index
            .iter()
            .filter_map(|n| state.orders.get(n))
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_order(&self, update: OrderUpdate) -> Result<u64, StoreError> {
        if take_fault(&self.failing_updates) {
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }

        let mut state = self.write()?;
        let state = &mut *state;

        let Some(order) = state.orders.get_mut(&update.number) else {
            return Ok(0);
        };
        if update.owner.is_some_and(|o| o != order.owner) {
            return Ok(0);
        }
        if !order.status.can_transition_to(update.status) {
            return Ok(0);
        }

        // Validate the credit before touching anything so a failure leaves
        // both the order and the balance as they were.
        let credit = update.credit();
        let credited = if credit.is_zero() {
            None
        } else {
            let user = state
                .users
                .get_mut(&order.owner)
                .ok_or(StoreError::UnknownUser(order.owner))?;
            let balance = user
                .balance
                .current
                .checked_add(credit)
                .ok_or_else(|| StoreError::Storage("balance overflow".to_string()))?;
            Some((user, balance))
        };

        order.status = update.status;
        if update.accrual.is_some() {
            order.accrual = update.accrual;
        }
        if let Some((user, balance)) = credited {
            user.balance.current = balance;
        }

        Ok(1)
    }
}

#[async_trait]
impl LedgerStore for InMemoryOrderStore {
    async fn register_user(&self, login: &str) -> Result<UserId, StoreError> {
        let mut state = self.write()?;
        if state.users.values().any(|u| u.login == login) {
            return Err(StoreError::DuplicateLogin(login.to_string()));
        }
        let id = UserId::new();
        state.users.insert(
            id,
            UserRecord {
                login: login.to_string(),
                balance: Balance::default(),
            },
        );
        Ok(id)
    }

    async fn put_order(&self, number: OrderNumber, owner: UserId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.users.contains_key(&owner) {
            return Err(StoreError::UnknownUser(owner));
        }

        if let Some(existing) = state.orders.get(&number) {
            return if existing.owner == owner {
                Err(StoreError::AlreadySubmitted(number))
            } else {
                Err(StoreError::OwnedByAnotherUser(number))
            };
        }

        state.order_index.push(number.clone());
        state
            .orders
            .insert(number.clone(), Order::new(number, owner, Utc::now()));
        Ok(())
    }

    async fn user_orders(&self, owner: UserId) -> Result<Vec<Order>, StoreError> {
        let state = self.read()?;
        Ok(state
            .order_index
            .iter()
            .filter_map(|n| state.orders.get(n))
            .filter(|o| o.owner == owner)
            .cloned()
            .collect())
    }

    async fn balance(&self, owner: UserId) -> Result<Balance, StoreError> {
        let state = self.read()?;
        state
            .users
            .get(&owner)
            .map(|u| u.balance)
            .ok_or(StoreError::UnknownUser(owner))
    }

    async fn withdraw(
        &self,
        owner: UserId,
        order: OrderNumber,
        sum: Points,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let user = state
            .users
            .get_mut(&owner)
            .ok_or(StoreError::UnknownUser(owner))?;

        let remaining = user
            .balance
            .current
            .checked_sub(sum)
            .ok_or(StoreError::InsufficientFunds)?;
        let withdrawn = user
            .balance
            .withdrawn
            .checked_add(sum)
            .ok_or_else(|| StoreError::Storage("withdrawn overflow".to_string()))?;
        user.balance.current = remaining;
        user.balance.withdrawn = withdrawn;

        state.withdrawals.push((
            owner,
            Withdrawal {
                order,
                sum,
                processed_at: Utc::now(),
            },
        ));
        Ok(())
    }

    async fn withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>, StoreError> {
        let state = self.read()?;
        Ok(state
            .withdrawals
            .iter()
            .filter(|(u, _)| *u == owner)
            .map(|(_, w)| w.clone())
            .collect())
    }
}
