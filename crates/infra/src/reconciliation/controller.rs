//! Supervises the poller and the reconciliation workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use loyalty_core::{Order, OrderNumber, OrderStatus};

use crate::accrual::AccrualQuery;
use crate::store::OrderStore;

use super::config::{ConfigError, ReconcilerConfig};
use super::cooldown::CooldownGate;
use super::poller::Poller;
use super::shutdown::Shutdown;
use super::worker::{ReconcileError, Reconciler, Reconciliation};

/// Pipeline runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Reconciliation attempts started.
    pub dispatched: u64,
    /// Orders moved into `PROCESSED`.
    pub processed: u64,
    /// Orders moved into `INVALID`.
    pub invalid: u64,
    /// Attempts where the accrual service was still working on the order.
    pub still_pending: u64,
    /// Attempts where the accrual service did not know the order yet.
    pub not_registered: u64,
    pub busy_signals: u64,
    pub transient_failures: u64,
    /// Orders received while an attempt for the same number was running.
    pub duplicates_skipped: u64,
    /// Last `max_requests_per_minute` hint seen in a busy signal.
    pub last_rate_hint: Option<u32>,
}

/// Final state of a stopped controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerReport {
    pub stats: ReconcileStats,
    /// First hard failure (panicked worker or poller), if any.
    pub first_failure: Option<String>,
}

/// State shared between the dispatch loop and the handle.
///
/// The first hard failure is published on a `watch` channel so the owner can
/// react to it as soon as it happens.
#[derive(Debug, Clone)]
struct SharedState {
    stats: Arc<Mutex<ReconcileStats>>,
    failure: Arc<watch::Sender<Option<String>>>,
}

impl SharedState {
    fn new() -> Self {
        let (failure, _rx) = watch::channel(None);
        Self {
            stats: Arc::default(),
            failure: Arc::new(failure),
        }
    }

    fn stats(&self) -> MutexGuard<'_, ReconcileStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn first_failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Keep only the first failure; later ones are logged and dropped.
    fn record_failure(&self, failure: String) {
        error!(failure = %failure, "hard failure in reconciliation pipeline");
        self.failure.send_if_modified(|first| {
            if first.is_some() {
                return false;
            }
            *first = Some(failure);
            true
        });
    }
}

/// Handle to a running controller.
#[derive(Debug)]
pub struct ControllerHandle {
    shutdown: Shutdown,
    shared: SharedState,
    gate: Arc<CooldownGate>,
    join: JoinHandle<()>,
}

impl ControllerHandle {
    /// Current pipeline statistics.
    pub fn stats(&self) -> ReconcileStats {
        self.shared.stats().clone()
    }

    /// First hard failure seen so far; the owner may use it to shut down.
    pub fn first_failure(&self) -> Option<String> {
        self.shared.first_failure()
    }

    /// Resolves with the first hard failure as soon as one is recorded.
    pub async fn failed(&self) -> String {
        let mut rx = self.shared.failure.subscribe();
        loop {
            if let Some(failure) = rx.borrow_and_update().clone() {
                return failure;
            }
            // The sender lives in `self`, so the channel cannot close under us.
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Time left on the current busy-signal pause.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.gate.remaining()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the controller to stop (after its shutdown signal fires).
    pub async fn join(self) -> ControllerReport {
        if let Err(e) = self.join.await {
            self.shared
                .record_failure(format!("controller task failed: {e}"));
        }
        ControllerReport {
            stats: self.shared.stats().clone(),
            first_failure: self.shared.first_failure(),
        }
    }

    /// Trigger shutdown and wait for the controller to stop.
    pub async fn shutdown(self) -> ControllerReport {
        self.shutdown.trigger();
        self.join().await
    }
}

/// Background order reconciliation.
///
/// Polls the store for unreconciled orders, reconciles them against the
/// accrual service on a bounded pool of tasks and pauses everything while the
/// accrual service reports that it is busy.
pub struct ReconciliationController<S, A> {
    store: Arc<S>,
    accrual: Arc<A>,
    config: ReconcilerConfig,
}

impl<S, A> ReconciliationController<S, A>
where
    S: OrderStore + 'static,
    A: AccrualQuery + 'static,
{
    pub fn new(store: Arc<S>, accrual: Arc<A>, config: ReconcilerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            accrual,
            config,
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Spawn the poller and the dispatch loop on the current tokio runtime.
    pub fn start(self, shutdown: Shutdown) -> ControllerHandle {
        let config = self.config;
        let gate = Arc::new(CooldownGate::new());
        let shared = SharedState::new();

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let poller = Poller::new(
            config.name.clone(),
            self.store.clone(),
            tx,
            config.poll_interval,
        );
        let reconciler = Reconciler::new(
            self.store,
            self.accrual,
            gate.clone(),
            shutdown.clone(),
            config.request_timeout,
        );

        info!(
            controller = %config.name,
            poll_interval = ?config.poll_interval,
            queue_capacity = config.queue_capacity,
            max_concurrent = config.max_concurrent,
            request_timeout = ?config.request_timeout,
            "reconciliation controller starting"
        );

        let poller_task = tokio::spawn(poller.run(shutdown.clone()));
        let dispatcher = Dispatcher {
            name: config.name,
            max_concurrent: config.max_concurrent,
            reconciler,
            gate: gate.clone(),
            shutdown: shutdown.clone(),
            shared: shared.clone(),
        };

        let loop_shared = shared.clone();
        let join = tokio::spawn(async move {
            let name = dispatcher.name.clone();
            dispatcher.run(rx).await;
            if let Err(e) = poller_task.await {
                loop_shared.record_failure(format!("order poller failed: {e}"));
            }
            info!(controller = %name, "reconciliation controller stopped");
        });

        ControllerHandle {
            shutdown,
            shared,
            gate,
            join,
        }
    }
}

type WorkerResult = (OrderNumber, Result<Reconciliation, ReconcileError>);

struct Dispatcher<S, A> {
    name: String,
    max_concurrent: usize,
    reconciler: Reconciler<S, A>,
    gate: Arc<CooldownGate>,
    shutdown: Shutdown,
    shared: SharedState,
}

impl<S, A> Dispatcher<S, A>
where
    S: OrderStore + 'static,
    A: AccrualQuery + 'static,
{
    async fn run(self, mut queue: mpsc::Receiver<Order>) {
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut in_flight: HashMap<OrderNumber, AbortHandle> = HashMap::new();
        let mut queue_open = true;

        loop {
            let has_capacity = queue_open && workers.len() < self.max_concurrent;

            tokio::select! {
                biased;

                _ = self.shutdown.triggered() => break,

                Some(joined) = workers.join_next() => match joined {
                    Ok((number, result)) => {
                        in_flight.remove(&number);
                        self.record(&number, result);
                    }
                    Err(e) => {
                        in_flight.retain(|_, handle| !handle.is_finished());
                        self.shared
                            .record_failure(format!("reconciliation worker failed: {e}"));
                    }
                },

                next = next_order(&self.gate, &self.shutdown, &mut queue), if has_capacity => {
                    match next {
                        Some(order) => self.dispatch(order, &mut workers, &mut in_flight),
                        None if self.shutdown.is_triggered() => break,
                        None => {
                            queue_open = false;
                            warn!(controller = %self.name, "work queue closed; no further orders will be dispatched");
                        }
                    }
                }
            }
        }

        // Drop the receiver first so a poller stuck on a full queue wakes up.
        drop(queue);
        let aborted = workers.len();
        workers.shutdown().await;
        if aborted > 0 {
            info!(controller = %self.name, aborted, "abandoned in-flight reconciliations");
        }
    }

    fn dispatch(
        &self,
        order: Order,
        workers: &mut JoinSet<WorkerResult>,
        in_flight: &mut HashMap<OrderNumber, AbortHandle>,
    ) {
        if in_flight.contains_key(&order.number) {
            debug!(controller = %self.name, order = %order.number, "order already in flight; skipping");
            self.shared.stats().duplicates_skipped += 1;
            return;
        }

        let reconciler = self.reconciler.clone();
        let number = order.number.clone();
        let handle = workers.spawn(async move {
            let result = reconciler.reconcile(&order).await;
            (order.number, result)
        });
        in_flight.insert(number, handle);
        self.shared.stats().dispatched += 1;
    }

    fn record(&self, number: &OrderNumber, result: Result<Reconciliation, ReconcileError>) {
        let mut stats = self.shared.stats();

        match result {
            Ok(Reconciliation::Finalized { status, accrual, rows }) if rows > 0 => {
                match status {
                    OrderStatus::Processed => stats.processed += 1,
                    _ => stats.invalid += 1,
                }
                info!(controller = %self.name, order = %number, status = %status, accrual = ?accrual, "order reconciled");
            }
            Ok(Reconciliation::Finalized { status, .. }) => {
                debug!(controller = %self.name, order = %number, status = %status, "order was already final");
            }
            Ok(Reconciliation::StillProcessing(remote)) => {
                stats.still_pending += 1;
                debug!(controller = %self.name, order = %number, remote = ?remote, "accrual still pending");
            }
            Ok(Reconciliation::NotRegistered) => {
                stats.not_registered += 1;
                debug!(controller = %self.name, order = %number, "order not registered with accrual service yet");
            }
            Ok(Reconciliation::Busy(signal)) => {
                stats.busy_signals += 1;
                if signal.max_requests_per_minute.is_some() {
                    stats.last_rate_hint = signal.max_requests_per_minute;
                }
                info!(
                    controller = %self.name,
                    order = %number,
                    cooldown_secs = signal.cooldown.as_secs(),
                    max_rpm = ?signal.max_requests_per_minute,
                    "accrual service busy; pausing dispatch"
                );
            }
            Ok(Reconciliation::Skipped) => {}
            Err(e) => {
                stats.transient_failures += 1;
                warn!(controller = %self.name, order = %number, error = %e, "reconciliation attempt failed; will retry next poll");
            }
        }
    }
}

/// Wait out any cooldown, then take the next order from the queue.
///
/// `None` when shutdown fired or the queue is closed.
async fn next_order(
    gate: &CooldownGate,
    shutdown: &Shutdown,
    queue: &mut mpsc::Receiver<Order>,
) -> Option<Order> {
    if !gate.wait_ready(shutdown).await {
        return None;
    }
    queue.recv().await
}
