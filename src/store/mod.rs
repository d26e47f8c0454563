//! Entity Store
//!
//! Typed view of the hosted document store. The backing store offers no
//! transactions and no multi-record atomicity; the only conditional write it
//! must support is [`EntityStore::compare_and_swap_balance`], which the
//! ledger uses for optimistic concurrency on the user's balance pair.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::Reservation;
use crate::models::{
    ApiLogEntry, ApiProvider, BalanceLogEntry, ExternalOrder, Notification, Order, OrderStatus,
    ReconciliationTask, Service, User,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{collection} record not found: {id}")]
    NotFound {
        collection: &'static str,
        id: String,
    },

    #[error("{collection} record already exists: {id}")]
    AlreadyExists {
        collection: &'static str,
        id: String,
    },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(collection: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection,
            id: id.into(),
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    // === Users ===

    async fn find_user(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Write a new balance pair only if the stored version still equals
    /// `expected_version`. Returns `None` when another writer got there first.
    async fn compare_and_swap_balance(
        &self,
        email: &str,
        expected_version: u64,
        balance: Decimal,
        reserved_balance: Decimal,
    ) -> Result<Option<User>, StoreError>;

    // === Catalogue ===

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError>;

    async fn update_order(&self, order: &Order) -> Result<(), StoreError>;

    /// Move the order to `to` only if it is still in `from`. Returns the
    /// updated order, or `None` when the status had already moved on.
    async fn transition_order_status(
        &self,
        id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, StoreError>;

    async fn get_service(&self, id: &str) -> Result<Option<Service>, StoreError>;

    async fn get_provider(&self, id: &str) -> Result<Option<ApiProvider>, StoreError>;

    // === External orders ===

    async fn create_external_order(&self, record: &ExternalOrder) -> Result<(), StoreError>;

    async fn update_external_order(&self, record: &ExternalOrder) -> Result<(), StoreError>;

    async fn find_external_order_for(
        &self,
        local_order_id: &str,
    ) -> Result<Option<ExternalOrder>, StoreError>;

    /// Submitted/processing records, least recently updated first
    async fn list_open_external_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<ExternalOrder>, StoreError>;

    // === Reservations ===

    async fn get_reservation(&self, order_id: &str) -> Result<Option<Reservation>, StoreError>;

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    // === Append-only audit ===

    async fn append_balance_log(&self, entry: &BalanceLogEntry) -> Result<(), StoreError>;

    async fn append_api_log(&self, entry: &ApiLogEntry) -> Result<(), StoreError>;

    async fn create_notification(&self, notification: &Notification) -> Result<(), StoreError>;

    // === Reconciliation backlog ===

    async fn create_reconciliation(&self, task: &ReconciliationTask) -> Result<(), StoreError>;

    async fn update_reconciliation(&self, task: &ReconciliationTask) -> Result<(), StoreError>;

    async fn list_open_reconciliations(
        &self,
        limit: usize,
    ) -> Result<Vec<ReconciliationTask>, StoreError>;
}
