use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use loyalty_core::{OrderNumber, OrderStatus, Points};

/// Order status as reported by the accrual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteStatus {
    /// Known to the service, calculation not started.
    Registered,
    /// Calculation in progress.
    Processing,
    /// Calculation finished; no points awarded.
    Invalid,
    /// Calculation finished; `accrual` points awarded.
    Processed,
}

impl RemoteStatus {
    /// The local terminal status this maps to, if the remote side is done.
    pub fn final_status(self) -> Option<OrderStatus> {
        match self {
            RemoteStatus::Registered | RemoteStatus::Processing => None,
            RemoteStatus::Invalid => Some(OrderStatus::Invalid),
            RemoteStatus::Processed => Some(OrderStatus::Processed),
        }
    }
}

/// Body of a `200 OK` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order: OrderNumber,
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
}

/// Rate-limit signal: stop querying for `cooldown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusySignal {
    pub cooldown: Duration,
    /// Informational hint parsed from the response body, when present.
    pub max_requests_per_minute: Option<u32>,
}

impl core::fmt::Display for BusySignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "wait {}s", self.cooldown.as_secs())?;
        if let Some(rpm) = self.max_requests_per_minute {
            write!(f, "; max rpm {rpm}")?;
        }
        Ok(())
    }
}

/// Result of asking the accrual service about one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    Known(OrderInfo),
    /// The service has no record of the order yet (HTTP 204).
    NotRegistered,
    /// The service is rate-limiting (HTTP 429).
    Busy(BusySignal),
}

/// Accrual query failure (anything other than the three outcomes above).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccrualError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("accrual request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("failed to decode accrual response: {0}")]
    Decode(String),

    /// A 429 answer whose cooldown could not be read.
    #[error("malformed busy signal: {0}")]
    MalformedBusy(String),
}

/// Accrual query capability.
#[async_trait]
pub trait AccrualQuery: Send + Sync {
    async fn order_info(&self, number: &OrderNumber) -> Result<AccrualOutcome, AccrualError>;
}

#[async_trait]
impl<A> AccrualQuery for Arc<A>
where
    A: AccrualQuery + ?Sized,
{
    async fn order_info(&self, number: &OrderNumber) -> Result<AccrualOutcome, AccrualError> {
        (**self).order_info(number).await
    }
}
