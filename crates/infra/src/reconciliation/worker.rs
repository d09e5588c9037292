//! Per-order reconciliation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use loyalty_core::{Order, OrderStatus, Points};

use crate::accrual::{AccrualError, AccrualOutcome, AccrualQuery, BusySignal, RemoteStatus};
use crate::store::{OrderStore, OrderUpdate, StoreError};

use super::cooldown::CooldownGate;
use super::shutdown::Shutdown;

/// What one reconciliation attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The accrual service reported a final status and it was written back.
    /// `rows == 0` means the write was a no-op (already final).
    Finalized {
        status: OrderStatus,
        accrual: Option<Points>,
        rows: u64,
    },
    /// The accrual service knows the order but has not finished with it.
    StillProcessing(RemoteStatus),
    /// The accrual service has no record of the order yet.
    NotRegistered,
    /// The accrual service is rate-limiting; nothing was written.
    Busy(BusySignal),
    /// Shutdown fired before the accrual service was queried.
    Skipped,
}

/// Transient failure of one attempt. The order stays non-terminal and is
/// picked up again by the next poll.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to mark order as processing: {0}")]
    MarkProcessing(#[source] StoreError),

    #[error("accrual query failed: {0}")]
    Query(#[source] AccrualError),

    #[error("accrual query timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to write final status: {0}")]
    WriteBack(#[source] StoreError),
}

/// Everything a worker needs to reconcile one order.
pub struct Reconciler<S, A> {
    store: Arc<S>,
    accrual: Arc<A>,
    gate: Arc<CooldownGate>,
    shutdown: Shutdown,
    request_timeout: Duration,
}

impl<S, A> Clone for Reconciler<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            accrual: self.accrual.clone(),
            gate: self.gate.clone(),
            shutdown: self.shutdown.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<S, A> Reconciler<S, A>
where
    S: OrderStore,
    A: AccrualQuery,
{
    pub fn new(
        store: Arc<S>,
        accrual: Arc<A>,
        gate: Arc<CooldownGate>,
        shutdown: Shutdown,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            accrual,
            gate,
            shutdown,
            request_timeout,
        }
    }

    /// Run one attempt for `order`:
    ///
    /// 1. `NEW` orders are first marked `PROCESSING`.
    /// 2. Wait out any active cooldown, then query the accrual service. A busy
    ///    answer trips the shared cooldown gate.
    /// 3. A final remote status is written back keyed by number and owner;
    ///    anything else leaves the order for the next poll.
    #[instrument(skip(self, order), fields(order = %order.number, status = %order.status))]
    pub async fn reconcile(&self, order: &Order) -> Result<Reconciliation, ReconcileError> {
        if order.status == OrderStatus::New {
            let rows = self
                .store
                .update_order(OrderUpdate::processing(order.number.clone()))
                .await
                .map_err(ReconcileError::MarkProcessing)?;
            debug!(rows, "marked order as processing");
        }

        if !self.gate.wait_ready(&self.shutdown).await {
            return Ok(Reconciliation::Skipped);
        }

        let query = self.accrual.order_info(&order.number);
        let outcome = tokio::time::timeout(self.request_timeout, query)
            .await
            .map_err(|_| ReconcileError::Timeout(self.request_timeout))?
            .map_err(ReconcileError::Query)?;

        let info = match outcome {
            AccrualOutcome::Known(info) => info,
            AccrualOutcome::NotRegistered => return Ok(Reconciliation::NotRegistered),
            AccrualOutcome::Busy(signal) => {
                // Pause the whole pipeline right away, before the controller
                // sees this result, so concurrent workers stop querying too.
                self.gate.trip(signal.cooldown);
                return Ok(Reconciliation::Busy(signal));
            }
        };

        if info.order != order.number {
            return Err(ReconcileError::Query(AccrualError::Decode(format!(
                "answer is for order {} instead of {}",
                info.order, order.number
            ))));
        }

        let Some(status) = info.status.final_status() else {
            return Ok(Reconciliation::StillProcessing(info.status));
        };

        let accrual = match status {
            OrderStatus::Processed => Some(info.accrual.unwrap_or(Points::ZERO)),
            _ => None,
        };

        let rows = self
            .store
            .update_order(OrderUpdate::finalize(
                order.number.clone(),
                order.owner,
                status,
                accrual,
            ))
            .await
            .map_err(ReconcileError::WriteBack)?;

        Ok(Reconciliation::Finalized {
            status,
            accrual,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use loyalty_core::{OrderNumber, UserId};

    use crate::accrual::{InMemoryAccrual, OrderInfo};
    use crate::store::{InMemoryOrderStore, LedgerStore};

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        accrual: Arc<InMemoryAccrual>,
        gate: Arc<CooldownGate>,
        reconciler: Reconciler<InMemoryOrderStore, InMemoryAccrual>,
        owner: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryOrderStore::new());
        let accrual = Arc::new(InMemoryAccrual::new());
        let gate = Arc::new(CooldownGate::new());
        let owner = store.register_user("alice").await.unwrap();
        let reconciler = Reconciler::new(
            store.clone(),
            accrual.clone(),
            gate.clone(),
            Shutdown::new(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            accrual,
            gate,
            reconciler,
            owner,
        }
    }

    impl Fixture {
        async fn submit(&self, number: &str) -> Order {
            let n = OrderNumber::new(number);
            self.store.put_order(n.clone(), self.owner).await.unwrap();
            self.store.order(&n).unwrap()
        }

        fn status(&self, number: &str) -> OrderStatus {
            self.store.order(&OrderNumber::new(number)).unwrap().status
        }
    }

    #[tokio::test]
    async fn processed_answer_finalizes_and_credits() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push_processed(&order.number, Points::whole(500));

        let result = f.reconciler.reconcile(&order).await.unwrap();
        assert_eq!(
            result,
            Reconciliation::Finalized {
                status: OrderStatus::Processed,
                accrual: Some(Points::whole(500)),
                rows: 1
            }
        );
        assert_eq!(f.status("79927398713"), OrderStatus::Processed);
        assert_eq!(f.store.balance(f.owner).await.unwrap().current, Points::whole(500));
    }

    #[tokio::test]
    async fn invalid_answer_finalizes_without_credit() {
        let f = fixture().await;
        let order = f.submit("12345678903").await;
        f.accrual.push_status(&order.number, RemoteStatus::Invalid);

        let result = f.reconciler.reconcile(&order).await.unwrap();
        assert!(matches!(
            result,
            Reconciliation::Finalized { status: OrderStatus::Invalid, rows: 1, .. }
        ));
        assert_eq!(f.store.balance(f.owner).await.unwrap().current, Points::ZERO);
    }

    #[tokio::test]
    async fn pending_answers_leave_order_processing() {
        let f = fixture().await;
        let order = f.submit("111").await;

        assert_eq!(
            f.reconciler.reconcile(&order).await.unwrap(),
            Reconciliation::NotRegistered
        );
        assert_eq!(f.status("111"), OrderStatus::Processing);

        f.accrual.push_status(&order.number, RemoteStatus::Registered);
        let order = f.store.order(&order.number).unwrap();
        assert_eq!(
            f.reconciler.reconcile(&order).await.unwrap(),
            Reconciliation::StillProcessing(RemoteStatus::Registered)
        );
        assert_eq!(f.status("111"), OrderStatus::Processing);
    }

    #[tokio::test]
    async fn busy_answer_is_reported_not_written() {
        let f = fixture().await;
        let order = f.submit("9278923470").await;
        f.accrual
            .push_busy(&order.number, Duration::from_secs(60), Some(100));

        let result = f.reconciler.reconcile(&order).await.unwrap();
        assert!(matches!(result, Reconciliation::Busy(b) if b.cooldown == Duration::from_secs(60)));
        assert_eq!(f.status("9278923470"), OrderStatus::Processing);
        assert!(f.gate.is_paused());
    }

    #[tokio::test]
    async fn store_failure_before_query_aborts_attempt() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push_processed(&order.number, Points::whole(500));
        f.store.fail_next_updates(1);

        let err = f.reconciler.reconcile(&order).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MarkProcessing(_)));
        assert_eq!(f.accrual.calls_for(&order.number), 0);
        assert_eq!(f.status("79927398713"), OrderStatus::New);
    }

    #[tokio::test]
    async fn query_error_leaves_state_untouched() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push(
            &order.number,
            Err(AccrualError::UnexpectedStatus {
                status: 500,
                body: "boom".into(),
            }),
        );

        let err = f.reconciler.reconcile(&order).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Query(AccrualError::UnexpectedStatus { .. })));
        assert_eq!(f.status("79927398713"), OrderStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_accrual_times_out() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push_processed(&order.number, Points::whole(1));
        f.accrual.set_latency(Duration::from_secs(60));

        let err = f.reconciler.reconcile(&order).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout(d) if d == Duration::from_secs(5)));
        assert_eq!(f.status("79927398713"), OrderStatus::Processing);
    }

    #[tokio::test]
    async fn repeated_terminal_write_is_a_no_op() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push_processed(&order.number, Points::whole(500));

        f.reconciler.reconcile(&order).await.unwrap();
        // A stale copy of the order (e.g. enqueued twice) reconciled again.
        let second = f.reconciler.reconcile(&order).await.unwrap();
        assert!(matches!(second, Reconciliation::Finalized { rows: 0, .. }));
        assert_eq!(f.store.balance(f.owner).await.unwrap().current, Points::whole(500));
    }

    #[tokio::test]
    async fn answer_for_another_order_is_rejected() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push(
            &order.number,
            Ok(AccrualOutcome::Known(OrderInfo {
                order: OrderNumber::new("12345678903"),
                status: RemoteStatus::Processed,
                accrual: Some(Points::whole(10)),
            })),
        );

        let err = f.reconciler.reconcile(&order).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Query(AccrualError::Decode(_))));
        assert_eq!(f.store.balance(f.owner).await.unwrap().current, Points::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn query_waits_for_active_cooldown() {
        let f = fixture().await;
        let order = f.submit("79927398713").await;
        f.accrual.push_processed(&order.number, Points::whole(1));

        let start = tokio::time::Instant::now();
        f.gate.trip(Duration::from_secs(30));
        f.reconciler.reconcile(&order).await.unwrap();

        let calls = f.accrual.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].at.duration_since(start) >= Duration::from_secs(30));
    }
}
