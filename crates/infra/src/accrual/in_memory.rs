use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use loyalty_core::{OrderNumber, Points};

use super::types::{AccrualError, AccrualOutcome, AccrualQuery, BusySignal, OrderInfo, RemoteStatus};

/// One recorded query against [`InMemoryAccrual`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualCall {
    pub number: OrderNumber,
    pub at: Instant,
}

type Scripted = Result<AccrualOutcome, AccrualError>;

#[derive(Debug, Default)]
struct Script {
    /// Outcomes consumed in order; the last one sticks.
    responses: VecDeque<Scripted>,
}

/// Scripted accrual service for tests/dev.
///
/// Each order number has a FIFO of outcomes. Once only one is left it is
/// returned for every further query. Unknown numbers answer `NotRegistered`.
#[derive(Debug, Default)]
pub struct InMemoryAccrual {
    scripts: Mutex<HashMap<OrderNumber, Script>>,
    calls: Mutex<Vec<AccrualCall>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryAccrual {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for `number`.
    pub fn push(&self, number: &OrderNumber, outcome: Result<AccrualOutcome, AccrualError>) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(number.clone())
                .or_default()
                .responses
                .push_back(outcome);
        }
        self
    }

    pub fn push_processed(&self, number: &OrderNumber, accrual: Points) -> &Self {
        self.push(
            number,
            Ok(AccrualOutcome::Known(OrderInfo {
                order: number.clone(),
                status: RemoteStatus::Processed,
                accrual: Some(accrual),
            })),
        )
    }

    pub fn push_status(&self, number: &OrderNumber, status: RemoteStatus) -> &Self {
        self.push(
            number,
            Ok(AccrualOutcome::Known(OrderInfo {
                order: number.clone(),
                status,
                accrual: None,
            })),
        )
    }

    pub fn push_not_registered(&self, number: &OrderNumber) -> &Self {
        self.push(number, Ok(AccrualOutcome::NotRegistered))
    }

    pub fn push_busy(&self, number: &OrderNumber, cooldown: Duration, rpm: Option<u32>) -> &Self {
        self.push(
            number,
            Ok(AccrualOutcome::Busy(BusySignal {
                cooldown,
                max_requests_per_minute: rpm,
            })),
        )
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = Some(latency);
        }
    }

    /// All queries received so far, in arrival order.
    pub fn calls(&self) -> Vec<AccrualCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, number: &OrderNumber) -> usize {
        self.calls().iter().filter(|c| &c.number == number).count()
    }

    fn next_response(&self, number: &OrderNumber) -> Scripted {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| AccrualError::Transport("scripted accrual lock poisoned".to_string()))?;

        match scripts.get_mut(number) {
            Some(script) if script.responses.len() > 1 => script
                .responses
                .pop_front()
                .unwrap_or(Ok(AccrualOutcome::NotRegistered)),
            Some(script) => script
                .responses
                .front()
                .cloned()
                .unwrap_or(Ok(AccrualOutcome::NotRegistered)),
            None => Ok(AccrualOutcome::NotRegistered),
        }
    }
}

#[async_trait]
impl AccrualQuery for InMemoryAccrual {
    async fn order_info(&self, number: &OrderNumber) -> Result<AccrualOutcome, AccrualError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(AccrualCall {
                number: number.clone(),
                at: Instant::now(),
            });
        }

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.next_response(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_scripted_outcome_sticks() {
        let accrual = InMemoryAccrual::new();
        let n = OrderNumber::new("111");
        accrual
            .push_not_registered(&n)
            .push_processed(&n, Points::whole(7));

        assert_eq!(accrual.order_info(&n).await.unwrap(), AccrualOutcome::NotRegistered);
        for _ in 0..3 {
            assert!(matches!(
                accrual.order_info(&n).await.unwrap(),
                AccrualOutcome::Known(OrderInfo { status: RemoteStatus::Processed, .. })
            ));
        }
        assert_eq!(accrual.calls_for(&n), 4);
    }

    #[tokio::test]
    async fn unknown_orders_are_not_registered() {
        let accrual = InMemoryAccrual::new();
        let outcome = accrual.order_info(&OrderNumber::new("42")).await.unwrap();
        assert_eq!(outcome, AccrualOutcome::NotRegistered);
    }
}
