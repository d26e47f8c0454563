//! Persisted record shapes
//!
//! Field names follow the storefront's stored documents so existing audit
//! logs stay readable.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generate a new record id (ULID string: sortable, coordination free)
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub balance: Decimal,
    #[serde(default)]
    pub reserved_balance: Decimal,
    /// Optimistic-concurrency counter, bumped on every balance write
    #[serde(default)]
    pub version: u64,
}

impl User {
    pub fn new(email: impl Into<String>, balance: Decimal) -> Self {
        Self {
            email: email.into(),
            full_name: None,
            balance,
            reserved_balance: Decimal::ZERO,
            version: 0,
        }
    }

    /// Funds not held by in-flight orders
    #[inline]
    pub fn available_balance(&self) -> Decimal {
        self.balance - self.reserved_balance
    }
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Statuses after which the customer's money must be returned
    #[inline]
    pub fn requires_refund(&self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Refunded)
    }

    /// Settled locally; upstream answers no longer change it
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Refunded
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub service_id: String,
    pub amount: Decimal,
    pub status: OrderStatus,
    /// Customer email
    pub created_by: String,
    #[serde(default)]
    pub imei: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// Extra provider-specific fields collected by the storefront form
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, Value>,
    /// Opaque fulfilment result, e.g. an unlock code
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_quantity() -> u32 {
    1
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        amount: Decimal,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            service_id: service_id.into(),
            amount,
            status: OrderStatus::Pending,
            created_by: created_by.into(),
            imei: None,
            quantity: 1,
            custom_fields: serde_json::Map::new(),
            result: None,
            admin_notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    /// The upstream provider's identifier for this product
    pub external_service_id: String,
    pub price: Decimal,
}

// ============================================================================
// Providers
// ============================================================================

/// Body encoding for JSON/XML providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    #[default]
    Json,
    Xml,
}

/// Explicit provider protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    Json,
    Xml,
    /// DHRU-style multipart form with base64 `parameters`
    DhruForm,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProtocol::Json => "json",
            WireProtocol::Xml => "xml",
            WireProtocol::DhruForm => "dhru_form",
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiProvider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub api_format: ApiFormat,
    /// Untagged legacy records fall back to name rules
    #[serde(default)]
    pub wire_protocol: Option<WireProtocol>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub auto_submit_enabled: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// External orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalOrderStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
    /// No longer followed: the local order was settled by an admin
    Closed,
}

impl ExternalOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalOrderStatus::Submitted => "submitted",
            ExternalOrderStatus::Processing => "processing",
            ExternalOrderStatus::Completed => "completed",
            ExternalOrderStatus::Failed => "failed",
            ExternalOrderStatus::Closed => "closed",
        }
    }

    /// Still waiting on the upstream provider
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ExternalOrderStatus::Submitted | ExternalOrderStatus::Processing
        )
    }
}

impl fmt::Display for ExternalOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalOrder {
    pub id: String,
    pub local_order_id: String,
    pub provider_id: String,
    pub external_order_id: String,
    pub status: ExternalOrderStatus,
    /// Raw upstream status string
    pub external_status: String,
    #[serde(default)]
    pub result: Option<String>,
    pub request_payload: String,
    pub response_payload: String,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Reserve,
    Confirm,
    Refund,
    Deposit,
    Bonus,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Reserve => "reserve",
            TransactionType::Confirm => "confirm",
            TransactionType::Refund => "refund",
            TransactionType::Deposit => "deposit",
            TransactionType::Bonus => "bonus",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Completed,
    Failed,
}

/// Immutable ledger audit record.
///
/// `previous_balance` / `new_balance` are the user's *available* balance
/// around the operation. Failed attempts record the same value on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceLogEntry {
    pub id: String,
    pub user_email: String,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub order_id: Option<String>,
    pub service_name: Option<String>,
    pub status: LogStatus,
    pub transaction_id: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// Structured failure classification attached to provider call logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    pub is_cors: bool,
    pub is_parameter_mismatch: bool,
    pub is_authentication: bool,
    pub is_server_error: bool,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiLogEntry {
    pub id: String,
    pub provider_id: String,
    pub order_id: String,
    pub endpoint: String,
    pub request_payload: String,
    pub response_payload: String,
    pub http_status: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_diagnosis: Option<ErrorDiagnosis>,
    pub detailed_log: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_email: String,
    pub order_id: Option<String>,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Compensation backlog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Open,
    Resolved,
    /// Retrying cannot succeed; left for an operator
    Parked,
}

/// A compensating refund that could not be applied and must be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTask {
    pub id: String,
    pub order_id: String,
    pub user_email: String,
    pub amount: Decimal,
    pub service_name: String,
    pub reason: String,
    pub status: ReconciliationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
