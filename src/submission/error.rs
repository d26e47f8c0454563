//! Submission Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::models::{ErrorDiagnosis, OrderStatus};
use crate::money::format_amount;
use crate::provider::MapperError;
use crate::store::StoreError;

fn money(value: &Decimal) -> String {
    format_amount(*value)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmissionError {
    // === Lookup ===
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Order {order_id} is {status}, only pending orders can be submitted")]
    InvalidOrderState { order_id: String, status: OrderStatus },

    // === Funds ===
    #[error(
        "Insufficient balance. Available: {}, required: {}",
        money(.available),
        money(.required)
    )]
    InsufficientFunds { available: Decimal, required: Decimal },

    // === Provider ===
    #[error("Auto-submit is disabled for provider {0}")]
    FeatureDisabled(String),

    #[error("Provider submission failed: {message}")]
    ProviderRejected {
        message: String,
        http_status: Option<u16>,
        diagnosis: Option<ErrorDiagnosis>,
    },

    #[error(transparent)]
    Mapper(#[from] MapperError),

    // === System ===
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Another invocation owns this order's reservation
    #[error("Order {0} is already being submitted")]
    AlreadyInFlight(String),
}

impl From<LedgerError> for SubmissionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance {
                available,
                required,
            } => SubmissionError::InsufficientFunds {
                available,
                required,
            },
            other => SubmissionError::Ledger(other),
        }
    }
}

impl SubmissionError {
    /// Error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            SubmissionError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            SubmissionError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            SubmissionError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            SubmissionError::InvalidOrderState { .. } => "INVALID_ORDER_STATE",
            SubmissionError::InsufficientFunds { .. } => "INSUFFICIENT_BALANCE",
            SubmissionError::FeatureDisabled(_) => "FEATURE_DISABLED",
            SubmissionError::ProviderRejected { .. } => "PROVIDER_SUBMISSION_FAILED",
            SubmissionError::Mapper(_) => "UNKNOWN_PROVIDER_ADAPTER",
            SubmissionError::Ledger(e) => e.code(),
            SubmissionError::Store(_) => "STORE_ERROR",
            SubmissionError::AlreadyInFlight(_) => "ORDER_IN_FLIGHT",
        }
    }

    /// HTTP status suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            SubmissionError::OrderNotFound(_)
            | SubmissionError::ServiceNotFound(_)
            | SubmissionError::ProviderNotFound(_) => 404,
            SubmissionError::InvalidOrderState { .. }
            | SubmissionError::InsufficientFunds { .. }
            | SubmissionError::FeatureDisabled(_) => 400,
            SubmissionError::AlreadyInFlight(_) => 409,
            SubmissionError::ProviderRejected { .. } => 502,
            SubmissionError::Ledger(e) => e.http_status(),
            SubmissionError::Mapper(_) | SubmissionError::Store(_) => 500,
        }
    }
}
