//! Accrual service boundary.
//!
//! The accrual service is the external system of record for how many points an
//! order is worth. It answers with the order's status, with "not registered
//! yet", or with a busy signal when its rate limit has been exceeded.

pub mod client;
pub mod in_memory;
pub mod types;

pub use client::{HttpAccrualClient, parse_busy_signal};
pub use in_memory::{AccrualCall, InMemoryAccrual};
pub use types::{AccrualError, AccrualOutcome, AccrualQuery, BusySignal, OrderInfo, RemoteStatus};
