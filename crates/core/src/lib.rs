//! `loyalty-core` — domain building blocks for the loyalty-points backend.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, order numbers, the order status state machine, and point amounts.

pub mod error;
pub mod id;
pub mod ledger;
pub mod order;
pub mod points;

pub use error::{DomainError, DomainResult};
pub use id::UserId;
pub use ledger::{Balance, Withdrawal};
pub use order::{Order, OrderNumber, OrderStatus, luhn_valid};
pub use points::Points;
