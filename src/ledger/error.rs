//! Ledger Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use super::state::ReservationState;
use crate::money::{MoneyError, format_amount};
use crate::store::StoreError;

fn money(value: &Decimal) -> String {
    format_amount(*value)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error(
        "Insufficient balance. Available: {}, required: {}",
        money(.available),
        money(.required)
    )]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    #[error("Order {0} already has a reservation")]
    DuplicateReservation(String),

    #[error("No reservation found for order {0}")]
    ReservationNotFound(String),

    #[error("Transaction id mismatch for order {order_id}: expected {expected}, got {provided}")]
    TransactionMismatch {
        order_id: String,
        expected: String,
        provided: String,
    },

    #[error("Reservation mismatch for order {order_id}: {reason}")]
    ReservationMismatch { order_id: String, reason: String },

    #[error("Invalid reservation transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: ReservationState,
        to: ReservationState,
    },

    #[error("Balance update for {0} kept conflicting with concurrent writers")]
    Contention(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::UserNotFound(_) => "USER_NOT_FOUND",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::DuplicateReservation(_) => "DUPLICATE_RESERVATION",
            LedgerError::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            LedgerError::TransactionMismatch { .. } => "TRANSACTION_MISMATCH",
            LedgerError::ReservationMismatch { .. } => "RESERVATION_MISMATCH",
            LedgerError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            LedgerError::Contention(_) => "BALANCE_CONTENTION",
            LedgerError::Store(_) => "STORE_ERROR",
        }
    }

    /// HTTP status suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::UserNotFound(_) | LedgerError::ReservationNotFound(_) => 404,
            LedgerError::InvalidAmount(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::DuplicateReservation(_)
            | LedgerError::TransactionMismatch { .. }
            | LedgerError::ReservationMismatch { .. }
            | LedgerError::InvalidTransition { .. } => 400,
            LedgerError::Contention(_) => 503,
            LedgerError::Store(_) => 500,
        }
    }

    /// The same call may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Contention(_) | LedgerError::Store(_))
    }
}
