//! Money Conversion Module
//!
//! Balances, prices and order amounts are fixed-point `Decimal` values in
//! currency units. Every amount that enters the ledger from the outside world
//! (admin endpoint, seed data) MUST go through [`validate_amount`] or
//! [`parse_amount`].
//!
//! ## Rules
//! 1. No floats anywhere in the money path
//! 2. Explicit errors, never silent truncation
//! 3. Amounts are strictly positive and carry at most [`MAX_DECIMALS`] places
//!
//! ```rust
//! use reseller_ledger::money::{format_amount, parse_amount};
//!
//! let amount = parse_amount("12.5").unwrap();
//! assert_eq!(format_amount(amount), "12.50");
//! ```

use rust_decimal::Decimal;
use thiserror::Error;

/// Maximum fractional digits accepted for an amount
pub const MAX_DECIMALS: u32 = 4;

/// Fractional digits always shown to users
const DISPLAY_DECIMALS: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Check that an already-typed amount is usable as a ledger amount.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = amount.normalize();
    if normalized.scale() > MAX_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MAX_DECIMALS,
        });
    }

    Ok(normalized)
}

/// Parse a client-supplied amount string.
///
/// Rejects signs, ambiguous forms like `.5` / `5.` and anything that is not
/// a plain decimal number.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    if let Some((whole, frac)) = amount_str.split_once('.') {
        if whole.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing leading zero (e.g., use 0.5 instead of .5)".into(),
            ));
        }
        if frac.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
            ));
        }
    }

    if !amount_str.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in amount: {amount_str}"
        )));
    }

    let amount = amount_str
        .parse::<Decimal>()
        .map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;

    validate_amount(amount)
}

/// Format an amount for messages and API output (at least two decimals).
pub fn format_amount(value: Decimal) -> String {
    let normalized = value.normalize();
    if normalized.scale() < DISPLAY_DECIMALS {
        format!("{:.prec$}", normalized, prec = DISPLAY_DECIMALS as usize)
    } else {
        normalized.to_string()
    }
}
