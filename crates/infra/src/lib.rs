//! Infrastructure layer: order storage, the accrual service client and the
//! background reconciliation pipeline that ties them together.

pub mod accrual;
pub mod reconciliation;
pub mod store;
