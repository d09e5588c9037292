//! Orders: number, status state machine, and the order record itself.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::points::Points;

/// Caller-supplied purchase order number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Wrap a number that has already been accepted (e.g. loaded from storage).
    pub fn new(number: impl Into<String>) -> Self {
        Self(number.into())
    }

    /// Validate user input: digits only, with a correct Luhn check digit.
    pub fn parse(input: &str) -> DomainResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("order number is empty"));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "order number must contain only digits: {trimmed:?}"
            )));
        }
        if !luhn_valid(trimmed) {
            return Err(DomainError::validation(format!(
                "order number fails the Luhn check: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Luhn (mod 10) check over an ASCII digit string.
///
/// Returns `false` for empty input or any non-digit character.
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (i, b) in digits.bytes().rev().enumerate() {
        if !b.is_ascii_digit() {
            return false;
        }
        let mut d = u32::from(b - b'0');
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }

    sum % 10 == 0
}

/// Order status lifecycle.
///
/// `NEW -> PROCESSING -> {PROCESSED | INVALID}`. The last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::Processing,
        OrderStatus::Invalid,
        OrderStatus::Processed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Position in the lifecycle; terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Invalid | OrderStatus::Processed => 2,
        }
    }

    /// Whether `self -> next` is a legal forward move.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses from which a transition into `self` is legal.
    pub fn predecessors(self) -> Vec<OrderStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    /// Check a transition, returning a domain error if it is not allowed.
    pub fn check_transition(self, next: OrderStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(DomainError::validation(format!("unknown order status: {other}"))),
        }
    }
}

/// A submitted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    /// Immutable after creation.
    #[serde(skip)]
    pub owner: UserId,
    pub status: OrderStatus,
    /// Only meaningful once `status == PROCESSED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly submitted order (`NEW`, no accrual).
    pub fn new(number: OrderNumber, owner: UserId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number,
            owner,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_luhn_numbers() {
        assert!(luhn_valid("79927398713"));
        assert!(luhn_valid("4561261212345467"));
        assert!(!luhn_valid("79927398710"));
        assert!(!luhn_valid("111"));
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("12a4"));
    }

    #[test]
    fn parse_trims_and_validates() {
        let n = OrderNumber::parse(" 79927398713\n").unwrap();
        assert_eq!(n.as_str(), "79927398713");

        assert!(OrderNumber::parse("").is_err());
        assert!(OrderNumber::parse("12-34").is_err());
        assert!(OrderNumber::parse("79927398710").is_err());
    }

    #[test]
    fn new_does_not_validate() {
        assert_eq!(OrderNumber::new("111").as_str(), "111");
    }

    #[test]
    fn status_only_moves_forward() {
        use OrderStatus::*;
        assert!(New.can_transition_to(Processing));
        assert!(New.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Invalid));
        assert!(Processing.can_transition_to(Processed));

        assert!(!Processing.can_transition_to(New));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Processed.can_transition_to(Invalid));
        assert!(!Invalid.can_transition_to(Processed));
    }

    #[test]
    fn predecessors_of_each_status() {
        use OrderStatus::*;
        assert!(New.predecessors().is_empty());
        assert_eq!(Processing.predecessors(), vec![New]);
        assert_eq!(Processed.predecessors(), vec![New, Processing]);
        assert_eq!(Invalid.predecessors(), vec![New, Processing]);
    }

    #[test]
    fn check_transition_reports_both_ends() {
        let err = OrderStatus::Processed
            .check_transition(OrderStatus::Processing)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "PROCESSED".into(),
                to: "PROCESSING".into()
            }
        );
    }

    #[test]
    fn status_wire_format_is_uppercase() {
        let json = serde_json::to_string(&OrderStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        for s in OrderStatus::ALL {
            assert_eq!(s.as_str().parse::<OrderStatus>().unwrap(), s);
        }
    }

    fn status_strategy() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::ALL.to_vec())
    }

    proptest! {
        /// Appending the right check digit to any digit string yields a valid number.
        #[test]
        fn appending_check_digit_makes_number_valid(body in "[0-9]{1,18}") {
            let check = (0..10u8)
                .find(|d| luhn_valid(&format!("{body}{d}")))
                .expect("exactly one check digit exists");
            let number = format!("{body}{check}");
            prop_assert!(OrderNumber::parse(&number).is_ok());

            let wrong = format!("{body}{}", (check + 1) % 10);
            prop_assert!(OrderNumber::parse(&wrong).is_err());
        }

        /// Any walk of legal transitions ends in at most two steps and never leaves a terminal state.
        #[test]
        fn transitions_are_monotonic(steps in prop::collection::vec(status_strategy(), 0..16)) {
            let mut current = OrderStatus::New;
            let mut moves = 0;
            for next in steps {
                if current.can_transition_to(next) {
                    prop_assert!(next.rank() > current.rank());
                    current = next;
                    moves += 1;
                }
            }
            prop_assert!(moves <= 2);
            if current.is_terminal() {
                for next in OrderStatus::ALL {
                    prop_assert!(!current.can_transition_to(next));
                }
            }
        }
    }
}
