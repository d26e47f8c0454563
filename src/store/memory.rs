//! In-memory entity store
//!
//! DashMap-backed implementation of [`EntityStore`]. Used by the binary for
//! local runs (optionally seeded from a JSON file) and by the test suites.
//! Individual operations can be made to fail on demand to exercise
//! compensation paths.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{EntityStore, StoreError};
use crate::ledger::Reservation;
use crate::models::{
    ApiLogEntry, ApiProvider, BalanceLogEntry, ExternalOrder, Notification, Order, OrderStatus,
    ReconciliationStatus, ReconciliationTask, Service, User,
};

/// Initial records for a local run
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub providers: Vec<ApiProvider>,
    #[serde(default)]
    pub orders: Vec<Order>,
}

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    orders: DashMap<String, Order>,
    services: DashMap<String, Service>,
    providers: DashMap<String, ApiProvider>,
    external_orders: DashMap<String, ExternalOrder>,
    reservations: DashMap<String, Reservation>,
    reconciliations: DashMap<String, ReconciliationTask>,
    balance_log: Mutex<Vec<BalanceLogEntry>>,
    api_log: Mutex<Vec<ApiLogEntry>>,
    notifications: Mutex<Vec<Notification>>,
    /// Operation names that currently fail with a backend error
    faults: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let store = Self::new();
        seed.users.into_iter().for_each(|u| store.insert_user(u));
        seed.services.into_iter().for_each(|s| store.insert_service(s));
        seed.providers.into_iter().for_each(|p| store.insert_provider(p));
        seed.orders.into_iter().for_each(|o| store.insert_order(o));
        store
    }

    /// Load a JSON seed file (`{"users": [...], "services": [...], ...}`)
    pub fn load_seed_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let seed: SeedData = serde_json::from_str(&content)?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.email.to_lowercase(), user);
    }

    pub fn insert_order(&self, order: Order) {
        self.orders.insert(order.id.clone(), order);
    }

    pub fn insert_service(&self, service: Service) {
        self.services.insert(service.id.clone(), service);
    }

    pub fn insert_provider(&self, provider: ApiProvider) {
        self.providers.insert(provider.id.clone(), provider);
    }

    pub fn insert_external_order(&self, record: ExternalOrder) {
        self.external_orders.insert(record.id.clone(), record);
    }

    /// Make every call of `op` (the trait method name) fail until cleared
    pub fn inject_failure(&self, op: &'static str) {
        self.lock_faults().insert(op);
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.lock_faults().remove(op);
    }

    // === Inspection ===

    pub fn user(&self, email: &str) -> Option<User> {
        self.users.get(&email.to_lowercase()).map(|u| u.clone())
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders.get(id).map(|o| o.clone())
    }

    pub fn reservation(&self, order_id: &str) -> Option<Reservation> {
        self.reservations.get(order_id).map(|r| r.clone())
    }

    pub fn external_orders(&self) -> Vec<ExternalOrder> {
        self.external_orders.iter().map(|e| e.clone()).collect()
    }

    pub fn external_order_for(&self, local_order_id: &str) -> Option<ExternalOrder> {
        self.external_orders
            .iter()
            .find(|e| e.local_order_id == local_order_id)
            .map(|e| e.clone())
    }

    pub fn balance_log(&self) -> Vec<BalanceLogEntry> {
        self.balance_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn api_log(&self) -> Vec<ApiLogEntry> {
        self.api_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    pub fn reconciliations(&self) -> Vec<ReconciliationTask> {
        self.reconciliations.iter().map(|t| t.clone()).collect()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, HashSet<&'static str>> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fault(&self, op: &'static str) -> Result<(), StoreError> {
        if self.lock_faults().contains(op) {
            return Err(StoreError::Backend(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn append<T: Clone>(log: &Mutex<Vec<T>>, item: &T) -> Result<(), StoreError> {
        log.lock()
            .map_err(|_| StoreError::Backend("audit log lock poisoned".into()))?
            .push(item.clone());
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.check_fault("find_user")?;
        Ok(self.user(email))
    }

    async fn compare_and_swap_balance(
        &self,
        email: &str,
        expected_version: u64,
        balance: Decimal,
        reserved_balance: Decimal,
    ) -> Result<Option<User>, StoreError> {
        self.check_fault("compare_and_swap_balance")?;
        let mut user = self
            .users
            .get_mut(&email.to_lowercase())
            .ok_or_else(|| StoreError::not_found("users", email))?;

        if user.version != expected_version {
            return Ok(None);
        }

        user.balance = balance;
        user.reserved_balance = reserved_balance;
        user.version += 1;
        Ok(Some(user.clone()))
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        self.check_fault("get_order")?;
        Ok(self.order(id))
    }

    async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        self.check_fault("update_order")?;
        let mut stored = self
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| StoreError::not_found("orders", &order.id))?;
        *stored = order.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_order_status(
        &self,
        id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, StoreError> {
        self.check_fault("transition_order_status")?;
        let mut stored = self
            .orders
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("orders", id))?;
        if stored.status != from {
            return Ok(None);
        }
        stored.status = to;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, StoreError> {
        self.check_fault("get_service")?;
        Ok(self.services.get(id).map(|s| s.clone()))
    }

    async fn get_provider(&self, id: &str) -> Result<Option<ApiProvider>, StoreError> {
        self.check_fault("get_provider")?;
        Ok(self.providers.get(id).map(|p| p.clone()))
    }

    async fn create_external_order(&self, record: &ExternalOrder) -> Result<(), StoreError> {
        self.check_fault("create_external_order")?;
        if self.external_orders.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists {
                collection: "external_orders",
                id: record.id.clone(),
            });
        }
        self.external_orders.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_external_order(&self, record: &ExternalOrder) -> Result<(), StoreError> {
        self.check_fault("update_external_order")?;
        let mut stored = self
            .external_orders
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::not_found("external_orders", &record.id))?;
        *stored = record.clone();
        Ok(())
    }

    async fn find_external_order_for(
        &self,
        local_order_id: &str,
    ) -> Result<Option<ExternalOrder>, StoreError> {
        self.check_fault("find_external_order_for")?;
        Ok(self.external_order_for(local_order_id))
    }

    async fn list_open_external_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<ExternalOrder>, StoreError> {
        self.check_fault("list_open_external_orders")?;
        let mut open: Vec<ExternalOrder> = self
            .external_orders
            .iter()
            .filter(|e| e.status.is_open())
            .map(|e| e.clone())
            .collect();
        open.sort_by_key(|e| e.updated_at);
        open.truncate(limit);
        Ok(open)
    }

    async fn get_reservation(&self, order_id: &str) -> Result<Option<Reservation>, StoreError> {
        self.check_fault("get_reservation")?;
        Ok(self.reservation(order_id))
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.check_fault("save_reservation")?;
        self.reservations
            .insert(reservation.order_id.clone(), reservation.clone());
        Ok(())
    }

    async fn append_balance_log(&self, entry: &BalanceLogEntry) -> Result<(), StoreError> {
        self.check_fault("append_balance_log")?;
        Self::append(&self.balance_log, entry)
    }

    async fn append_api_log(&self, entry: &ApiLogEntry) -> Result<(), StoreError> {
        self.check_fault("append_api_log")?;
        Self::append(&self.api_log, entry)
    }

    async fn create_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check_fault("create_notification")?;
        Self::append(&self.notifications, notification)
    }

    async fn create_reconciliation(&self, task: &ReconciliationTask) -> Result<(), StoreError> {
        self.check_fault("create_reconciliation")?;
        self.reconciliations.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_reconciliation(&self, task: &ReconciliationTask) -> Result<(), StoreError> {
        self.check_fault("update_reconciliation")?;
        let mut stored = self
            .reconciliations
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("reconciliations", &task.id))?;
        *stored = task.clone();
        Ok(())
    }

    async fn list_open_reconciliations(
        &self,
        limit: usize,
    ) -> Result<Vec<ReconciliationTask>, StoreError> {
        self.check_fault("list_open_reconciliations")?;
        let mut open: Vec<ReconciliationTask> = self
            .reconciliations
            .iter()
            .filter(|t| t.status == ReconciliationStatus::Open)
            .map(|t| t.clone())
            .collect();
        open.sort_by_key(|t| t.created_at);
        open.truncate(limit);
        Ok(open)
    }
}
