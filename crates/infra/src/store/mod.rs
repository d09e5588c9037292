//! Order/ledger storage boundary.
//!
//! The reconciliation pipeline only needs [`OrderStore`]; the wider
//! [`LedgerStore`] covers order submission, balances and withdrawals for the
//! surrounding API.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;
pub use r#trait::{LedgerStore, OrderStore, OrderUpdate, StoreError};
