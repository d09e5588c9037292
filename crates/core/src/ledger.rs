//! Balance and withdrawal models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::order::OrderNumber;
use crate::points::Points;

/// A user's point balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub current: Points,
    pub withdrawn: Points,
}

/// A completed withdrawal of points against an order number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub order: OrderNumber,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}
