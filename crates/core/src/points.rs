//! Loyalty point amounts.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

/// Non-negative amount of loyalty points.
///
/// Stored in the smallest unit (hundredths of a point) so balance arithmetic
/// stays exact. On the wire it is a plain JSON number (`729.98`).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    /// Build from minor units (hundredths).
    pub fn from_minor(minor: i64) -> Result<Self, DomainError> {
        if minor < 0 {
            return Err(DomainError::validation(format!(
                "points must be non-negative, got {minor} minor units"
            )));
        }
        Ok(Self(minor))
    }

    /// Build from whole points.
    pub fn whole(points: u32) -> Self {
        Self(i64::from(points) * 100)
    }

    /// Build from a decimal amount, rounding to the nearest hundredth.
    pub fn from_f64(value: f64) -> Result<Self, DomainError> {
        if !value.is_finite() || value < 0.0 {
            return Err(DomainError::validation(format!(
                "points must be a finite non-negative number, got {value}"
            )));
        }
        let minor = (value * 100.0).round();
        if minor > i64::MAX as f64 {
            return Err(DomainError::validation("points amount is too large"));
        }
        Ok(Self(minor as i64))
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Points) -> Option<Points> {
        self.0.checked_add(other.0).map(Points)
    }

    /// Subtract, returning `None` if the result would be negative.
    pub fn checked_sub(self, other: Points) -> Option<Points> {
        match self.0.checked_sub(other.0) {
            Some(v) if v >= 0 => Some(Points(v)),
            _ => None,
        }
    }
}

impl core::fmt::Display for Points {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Points::from_f64(value).map_err(serde::de::Error::custom)
    }
}
