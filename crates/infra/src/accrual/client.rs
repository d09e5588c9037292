//! HTTP client for the accrual service.
//!
//! Wire mapping for `GET {base}/api/orders/{number}`:
//!
//! | Status | Outcome |
//! |--------|---------|
//! | `200` | `Known(OrderInfo)` from the JSON body |
//! | `204` | `NotRegistered` |
//! | `429` | `Busy` (cooldown from `Retry-After`, rate hint from the body) |
//! | other | `AccrualError::UnexpectedStatus` |

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, instrument};

use loyalty_core::OrderNumber;

use super::types::{AccrualError, AccrualOutcome, AccrualQuery, BusySignal, OrderInfo};

const ORDERS_PATH: &str = "/api/orders";

/// Largest `Retry-After` accepted from the service (one day).
const MAX_RETRY_AFTER_SECS: u64 = 24 * 60 * 60;

static FIRST_INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("static regex is valid"));

/// reqwest-backed accrual client.
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAccrualClient {
    /// Build a client for the service at `base_url` (scheme optional, `http` assumed).
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, AccrualError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccrualError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url.as_ref()),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!("{}{}/{}", self.base_url, ORDERS_PATH, number)
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Read a 429 answer into a [`BusySignal`].
///
/// The cooldown (`Retry-After`, integer seconds, at most one day) is required.
/// The rate hint is the first integer found in the body and is optional.
pub fn parse_busy_signal(headers: &HeaderMap, body: &str) -> Result<BusySignal, AccrualError> {
    let raw = headers
        .get(RETRY_AFTER)
        .ok_or_else(|| AccrualError::MalformedBusy("missing Retry-After header".to_string()))?
        .to_str()
        .map_err(|e| AccrualError::MalformedBusy(format!("unreadable Retry-After header: {e}")))?;

    let seconds: u64 = raw.trim().parse().map_err(|e| {
        AccrualError::MalformedBusy(format!("Retry-After is not a number of seconds ({raw:?}): {e}"))
    })?;
    if seconds > MAX_RETRY_AFTER_SECS {
        return Err(AccrualError::MalformedBusy(format!(
            "Retry-After of {seconds}s exceeds the {MAX_RETRY_AFTER_SECS}s limit"
        )));
    }

    let max_requests_per_minute = FIRST_INTEGER
        .find(body)
        .and_then(|m| m.as_str().parse::<u32>().ok());

    Ok(BusySignal {
        cooldown: Duration::from_secs(seconds),
        max_requests_per_minute,
    })
}

#[async_trait]
impl AccrualQuery for HttpAccrualClient {
    #[instrument(skip(self), fields(order = %number))]
    async fn order_info(&self, number: &OrderNumber) -> Result<AccrualOutcome, AccrualError> {
        let response = self
            .client
            .get(self.order_url(number))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AccrualError::Timeout(self.timeout)
                } else {
                    AccrualError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = %status, "accrual responded");

        match status {
            StatusCode::OK => {
                let info: OrderInfo = response
                    .json()
                    .await
                    .map_err(|e| AccrualError::Decode(e.to_string()))?;
                Ok(AccrualOutcome::Known(info))
            }
            StatusCode::NO_CONTENT => Ok(AccrualOutcome::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                parse_busy_signal(&headers, &body).map(AccrualOutcome::Busy)
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(AccrualError::UnexpectedStatus {
                    status: other.as_u16(),
                    body,
                })
            }
        }
    }
}
