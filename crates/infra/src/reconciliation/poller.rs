use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use loyalty_core::Order;

use crate::store::OrderStore;

use super::shutdown::Shutdown;

/// Result of a single poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// This many orders were pushed onto the queue.
    Enqueued(usize),
    /// The store could not be read; the tick was skipped.
    StoreFailed,
    /// Shutdown fired or the queue was closed mid-tick.
    Stopped,
}

/// Periodically moves unreconciled orders from the store onto the work queue.
///
/// A full queue blocks the poller (back-pressure) instead of dropping orders,
/// which in turn delays the next tick.
pub struct Poller<S> {
    name: String,
    store: S,
    queue: mpsc::Sender<Order>,
    interval: Duration,
}

impl<S: OrderStore> Poller<S> {
    pub fn new(
        name: impl Into<String>,
        store: S,
        queue: mpsc::Sender<Order>,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            queue,
            interval,
        }
    }

    /// Tick until shutdown or until the consumer side of the queue is gone.
    pub async fn run(self, shutdown: Shutdown) {
        info!(poller = %self.name, interval = ?self.interval, "order poller started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    if self.poll_once(&shutdown).await == PollOutcome::Stopped {
                        break;
                    }
                }
            }
        }

        info!(poller = %self.name, "order poller stopped");
    }

    /// Fetch once and enqueue everything, in store order.
    pub async fn poll_once(&self, shutdown: &Shutdown) -> PollOutcome {
        let orders = match self.store.fetch_unreconciled_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(poller = %self.name, error = %e, "failed to fetch unreconciled orders; skipping tick");
                return PollOutcome::StoreFailed;
            }
        };

        debug!(poller = %self.name, count = orders.len(), "fetched unreconciled orders");

        let mut enqueued = 0;
        for order in orders {
            tokio::select! {
                _ = shutdown.triggered() => return PollOutcome::Stopped,
                sent = self.queue.send(order) => {
                    if sent.is_err() {
                        debug!(poller = %self.name, "work queue closed");
                        return PollOutcome::Stopped;
                    }
                    enqueued += 1;
                }
            }
        }

        PollOutcome::Enqueued(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use loyalty_core::{OrderNumber, OrderStatus, Points};

    use crate::store::{InMemoryOrderStore, LedgerStore, OrderUpdate};

    async fn seeded(numbers: &[&str]) -> Arc<InMemoryOrderStore> {
        let store = Arc::new(InMemoryOrderStore::new());
        let user = store.register_user("alice").await.unwrap();
        for n in numbers {
            store.put_order(OrderNumber::new(*n), user).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn enqueues_in_store_order_and_skips_terminal() {
        let store = seeded(&["1", "2", "3"]).await;
        let owner = store.order(&OrderNumber::new("2")).unwrap().owner;
        store
            .update_order(OrderUpdate::finalize(
                OrderNumber::new("2"),
                owner,
                OrderStatus::Processed,
                Some(Points::whole(1)),
            ))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let poller = Poller::new("test", store, tx, Duration::from_secs(10));

        assert_eq!(poller.poll_once(&Shutdown::new()).await, PollOutcome::Enqueued(2));
        assert_eq!(rx.recv().await.unwrap().number.as_str(), "1");
        assert_eq!(rx.recv().await.unwrap().number.as_str(), "3");
    }

    #[tokio::test]
    async fn store_failure_skips_the_tick() {
        let store = seeded(&["1"]).await;
        store.fail_next_fetches(1);

        let (tx, mut rx) = mpsc::channel(10);
        let poller = Poller::new("test", store, tx, Duration::from_secs(10));

        assert_eq!(poller.poll_once(&Shutdown::new()).await, PollOutcome::StoreFailed);
        assert!(rx.try_recv().is_err());
        assert_eq!(poller.poll_once(&Shutdown::new()).await, PollOutcome::Enqueued(1));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_stalls_instead_of_dropping() {
        let store = seeded(&["1", "2", "3", "4", "5"]).await;
        let (tx, mut rx) = mpsc::channel(2);
        let poller = Poller::new("test", store, tx, Duration::from_secs(10));
        let shutdown = Shutdown::new();

        let tick = tokio::spawn(async move { poller.poll_once(&shutdown).await });

        // Let the poller fill the queue and block on the third send.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tick.is_finished());

        let mut received = Vec::new();
        while received.len() < 5 {
            received.push(rx.recv().await.unwrap().number.to_string());
        }
        assert_eq!(received, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(tick.await.unwrap(), PollOutcome::Enqueued(5));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let store = seeded(&[]).await;
        let (tx, _rx) = mpsc::channel(1);
        let poller = Poller::new("test", store, tx, Duration::from_secs(10));
        let shutdown = Shutdown::new();

        let task = tokio::spawn(poller.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
