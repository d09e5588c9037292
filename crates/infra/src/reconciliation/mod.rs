//! Order reconciliation pipeline.
//!
//! A [`Poller`] periodically pushes unreconciled orders onto a bounded queue;
//! the [`ReconciliationController`] drains it onto a pool of tasks, each of
//! which reconciles one order against the accrual service. A busy answer from
//! the accrual service trips the shared [`CooldownGate`] and pauses the whole
//! pipeline until the cooldown has elapsed.

pub mod config;
pub mod controller;
pub mod cooldown;
pub mod poller;
pub mod shutdown;
pub mod worker;

pub use config::{ConfigError, ReconcilerConfig};
pub use controller::{ControllerHandle, ControllerReport, ReconcileStats, ReconciliationController};
pub use cooldown::CooldownGate;
pub use poller::{PollOutcome, Poller};
pub use shutdown::Shutdown;
pub use worker::{ReconcileError, Reconciler, Reconciliation};
