//! Reservation State Definitions
//!
//! ```text
//! (unreserved) → RESERVED → CONFIRMED → REFUNDED
//!                    ↓                      ↑
//!                    └──────────────────────┘
//! ```
//!
//! RESERVED is the only transient state. CONFIRMED → REFUNDED exists for
//! admin refunds of orders whose deduction was already made final.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Funds held against an in-flight order
    Reserved,
    /// Hold converted into a permanent deduction
    Confirmed,
    /// Terminal: hold released or deduction credited back
    Refunded,
}

impl ReservationState {
    /// No further transitions possible
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Refunded)
    }

    /// Funds are still counted in `reserved_balance`
    #[inline]
    pub fn is_holding(&self) -> bool {
        matches!(self, ReservationState::Reserved)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: ReservationState) -> bool {
        matches!(
            (self, next),
            (ReservationState::Reserved, ReservationState::Confirmed)
                | (ReservationState::Reserved, ReservationState::Refunded)
                | (ReservationState::Confirmed, ReservationState::Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "RESERVED",
            ReservationState::Confirmed => "CONFIRMED",
            ReservationState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Monetary lifecycle of one order, keyed by order id.
///
/// Doubles as the idempotency record: a confirm or refund that finds the
/// reservation already past the requested transition is a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: String,
    /// `RES-{order_id}-{epoch_millis}`
    pub transaction_id: String,
    pub user_email: String,
    pub amount: Decimal,
    pub state: ReservationState,
    pub refund_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        order_id: impl Into<String>,
        transaction_id: impl Into<String>,
        user_email: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            transaction_id: transaction_id.into(),
            user_email: user_email.into(),
            amount,
            state: ReservationState::Reserved,
            refund_transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn belongs_to(&self, user_email: &str) -> bool {
        self.user_email.eq_ignore_ascii_case(user_email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ReservationState::Refunded.is_terminal());
        assert!(!ReservationState::Reserved.is_terminal());
        assert!(!ReservationState::Confirmed.is_terminal());
    }

    #[test]
    fn test_transitions() {
        use ReservationState::*;
        assert!(Reserved.can_transition_to(Confirmed));
        assert!(Reserved.can_transition_to(Refunded));
        assert!(Confirmed.can_transition_to(Refunded));

        assert!(!Reserved.can_transition_to(Reserved));
        assert!(!Confirmed.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Reserved));
        assert!(!Refunded.can_transition_to(Confirmed));
        assert!(!Refunded.can_transition_to(Refunded));
    }

    #[test]
    fn test_only_reserved_holds_funds() {
        assert!(ReservationState::Reserved.is_holding());
        assert!(!ReservationState::Confirmed.is_holding());
        assert!(!ReservationState::Refunded.is_holding());
    }

    #[test]
    fn test_belongs_to_is_case_insensitive() {
        let r = Reservation::new("o1", "RES-o1-1", "Buyer@Example.com", Decimal::ONE);
        assert!(r.belongs_to("buyer@example.com"));
        assert!(!r.belongs_to("other@example.com"));
    }

    #[test]
    fn test_display() {
        assert_eq!(ReservationState::Reserved.to_string(), "RESERVED");
        assert_eq!(ReservationState::Refunded.to_string(), "REFUNDED");
    }
}
