//! Request / response types for the admin HTTP surface
//!
//! Errors are returned as `{ "error": <message>, "code": <CODE> }` with the
//! HTTP status suggested by the domain error.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::admin::AdminError;
use crate::ledger::LedgerError;
use crate::money::{MoneyError, parse_amount};
use crate::store::StoreError;
use crate::submission::SubmissionError;

pub mod error_codes {
    pub const MISSING_AUTH: &str = "MISSING_AUTH";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const INVALID_AMOUNT: &str = "INVALID_AMOUNT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::MISSING_FIELD,
            format!("Missing required field: {field}"),
        )
    }

    fn from_domain(status: u16, code: &str, message: String) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
                code: self.code,
            }),
        )
            .into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self::from_domain(err.http_status(), err.code(), err.to_string())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(err: SubmissionError) -> Self {
        Self::from_domain(err.http_status(), err.code(), err.to_string())
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        Self::from_domain(err.http_status(), err.code(), err.to_string())
    }
}

impl From<MoneyError> for ApiError {
    fn from(err: MoneyError) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_AMOUNT,
            format!("Invalid amount: {err}"),
        )
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            err.to_string(),
        )
    }
}

// ============================================================================
// Admin balance control
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAction {
    Check,
    Reserve,
    Confirm,
    Refund,
    Deposit,
    Bonus,
}

/// Amount exactly as the client sent it. JSON numbers are read by their
/// literal text so both forms go through the same parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Text(String),
    Number(serde_json::Number),
}

impl RawAmount {
    pub fn parse(&self) -> Result<Decimal, MoneyError> {
        match self {
            RawAmount::Text(text) => parse_amount(text),
            RawAmount::Number(number) => parse_amount(&number.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub action: BalanceAction,
    pub user_email: String,
    pub amount: RawAmount,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl BalanceRequest {
    pub fn amount(&self) -> Result<Decimal, ApiError> {
        Ok(self.amount.parse()?)
    }

    pub fn order_id(&self) -> Result<&str, ApiError> {
        required(&self.order_id, "order_id")
    }

    pub fn transaction_id(&self) -> Result<&str, ApiError> {
        required(&self.transaction_id, "transaction_id")
    }

    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or("")
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::missing_field(field))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ledger_error_mapping() {
        let err: ApiError = LedgerError::InsufficientBalance {
            available: dec!(5),
            required: dec!(10),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INSUFFICIENT_BALANCE");

        let err: ApiError = LedgerError::UserNotFound("x".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_balance_request_parsing() {
        let req: BalanceRequest = serde_json::from_str(
            r#"{"action": "reserve", "user_email": "a@example.com", "amount": 12.5, "order_id": "o1"}"#,
        )
        .unwrap();
        assert_eq!(req.action, BalanceAction::Reserve);
        assert_eq!(req.amount().unwrap(), dec!(12.5));
        assert_eq!(req.order_id().unwrap(), "o1");
        assert!(req.transaction_id().is_err());
    }

    #[test]
    fn test_balance_request_amount_is_validated() {
        let parse = |amount: serde_json::Value| {
            let req: BalanceRequest = serde_json::from_value(serde_json::json!({
                "action": "deposit",
                "user_email": "a@example.com",
                "amount": amount,
            }))
            .unwrap();
            req.amount()
        };

        assert_eq!(parse(serde_json::json!("25")).unwrap(), dec!(25));
        assert_eq!(parse(serde_json::json!(1000)).unwrap(), dec!(1000));

        for bad in [
            serde_json::json!("-5"),
            serde_json::json!("0"),
            serde_json::json!(".5"),
            serde_json::json!("1e3"),
            serde_json::json!("0.00001"),
            serde_json::json!(-5),
        ] {
            let err = parse(bad.clone()).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "{bad}");
            assert_eq!(err.code, error_codes::INVALID_AMOUNT, "{bad}");
        }
    }
}
