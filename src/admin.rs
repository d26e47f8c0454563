//! Admin order status changes
//!
//! Moving an order to `failed` or `refunded` returns the customer's money
//! through [`BalanceLedger::refund`]: a held reservation is released, a
//! confirmed charge is credited back, an already refunded order is left alone.
//! Settling an order also closes its open external record so the status
//! poller stops following it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::{BalanceLedger, LedgerError, RefundReceipt};
use crate::models::{ExternalOrderStatus, Notification, Order, OrderStatus, new_id};
use crate::store::{EntityStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
    #[serde(default)]
    pub admin_notes: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateOutcome {
    pub order: Order,
    /// Present when money moved back to the customer
    pub refund: Option<RefundReceipt>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdminError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Refund failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdminError {
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            AdminError::Ledger(e) => e.code(),
            AdminError::Store(_) => "STORE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AdminError::OrderNotFound(_) => 404,
            AdminError::Ledger(e) => e.http_status(),
            AdminError::Store(_) => 500,
        }
    }
}

pub struct AdminOrderService {
    store: Arc<dyn EntityStore>,
    ledger: Arc<BalanceLedger>,
}

impl AdminOrderService {
    pub fn new(store: Arc<dyn EntityStore>, ledger: Arc<BalanceLedger>) -> Self {
        Self { store, ledger }
    }

    /// Apply an admin status change. A refund failure aborts the change.
    pub async fn update_status(
        &self,
        order_id: &str,
        update: StatusUpdate,
    ) -> Result<StatusUpdateOutcome, AdminError> {
        let mut order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AdminError::OrderNotFound(order_id.to_string()))?;

        let previous = order.status;
        let refund = if update.status.requires_refund() {
            self.refund(&order, &update).await?
        } else {
            None
        };

        order.status = update.status;
        if update.admin_notes.is_some() {
            order.admin_notes = update.admin_notes;
        }
        if update.result.is_some() {
            order.result = update.result;
        }
        order.updated_at = Utc::now();
        self.store.update_order(&order).await?;

        info!(
            order_id,
            from = %previous,
            to = %order.status,
            refunded = refund.is_some(),
            "Order status changed by admin"
        );

        if order.status.is_closed() {
            self.close_external(&order).await;
        }
        if previous != order.status {
            self.notify(&order).await;
        }

        Ok(StatusUpdateOutcome { order, refund })
    }

    async fn refund(
        &self,
        order: &Order,
        update: &StatusUpdate,
    ) -> Result<Option<RefundReceipt>, AdminError> {
        let service_name = match self.store.get_service(&order.service_id).await? {
            Some(service) => service.name,
            None => order.service_id.clone(),
        };
        let reason = update
            .admin_notes
            .clone()
            .unwrap_or_else(|| format!("Order marked {} by admin", update.status));

        match self
            .ledger
            .refund(&order.created_by, order.amount, &order.id, &service_name, &reason)
            .await
        {
            Ok(receipt) if receipt.replayed => Ok(None),
            Ok(receipt) => Ok(Some(receipt)),
            Err(LedgerError::ReservationNotFound(_)) => {
                warn!(order_id = %order.id, "No reservation for order, nothing to refund");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close_external(&self, order: &Order) {
        let mut record = match self.store.find_external_order_for(&order.id).await {
            Ok(Some(record)) if record.status.is_open() => record,
            Ok(_) => return,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Failed to look up external order");
                return;
            }
        };

        record.status = ExternalOrderStatus::Closed;
        record.updated_at = Utc::now();
        match self.store.update_external_order(&record).await {
            Ok(()) => info!(
                order_id = %order.id,
                external_order_id = %record.external_order_id,
                "External order closed"
            ),
            Err(e) => warn!(order_id = %order.id, error = %e, "Failed to close external order"),
        }
    }

    async fn notify(&self, order: &Order) {
        let notification = Notification {
            id: new_id(),
            user_email: order.created_by.clone(),
            order_id: Some(order.id.clone()),
            title: format!("Order {}", order.status),
            message: format!("Your order {} is now {}.", order.id, order.status),
            is_read: false,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.create_notification(&notification).await {
            warn!(order_id = %order.id, error = %e, "Failed to store notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExternalOrder, LogStatus, TransactionType, User};
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const EMAIL: &str = "buyer@example.com";

    fn setup() -> (Arc<MemoryStore>, Arc<BalanceLedger>, AdminOrderService) {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new(EMAIL, dec!(50)));
        let mut order = Order::new("o1", "svc-1", dec!(10), EMAIL);
        order.status = OrderStatus::Processing;
        store.insert_order(order);

        let ledger = Arc::new(BalanceLedger::new(store.clone()));
        let service = AdminOrderService::new(store.clone(), ledger.clone());
        (store, ledger, service)
    }

    fn update(status: OrderStatus) -> StatusUpdate {
        StatusUpdate {
            status,
            admin_notes: Some("checked with provider".into()),
            result: None,
        }
    }

    #[tokio::test]
    async fn test_failing_confirmed_order_credits_back() {
        let (store, ledger, service) = setup();
        let r = ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();
        ledger
            .confirm(EMAIL, dec!(10), "o1", "Unlock", &r.transaction_id)
            .await
            .unwrap();
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(40));

        let outcome = service
            .update_status("o1", update(OrderStatus::Failed))
            .await
            .unwrap();
        assert!(outcome.refund.is_some());
        assert_eq!(outcome.order.status, OrderStatus::Failed);
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(50));

        let refund = store
            .balance_log()
            .into_iter()
            .find(|e| e.transaction_type == TransactionType::Refund)
            .unwrap();
        assert_eq!(refund.status, LogStatus::Completed);
        assert_eq!(refund.notes, "checked with provider");
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_refunding_held_order_releases_hold() {
        let (store, ledger, service) = setup();
        ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();

        let outcome = service
            .update_status("o1", update(OrderStatus::Refunded))
            .await
            .unwrap();
        assert!(outcome.refund.unwrap().released_hold);

        let user = store.user(EMAIL).unwrap();
        assert_eq!(user.balance, dec!(50));
        assert_eq!(user.reserved_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_second_refund_status_is_noop() {
        let (store, ledger, service) = setup();
        let r = ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();
        ledger
            .confirm(EMAIL, dec!(10), "o1", "Unlock", &r.transaction_id)
            .await
            .unwrap();

        service.update_status("o1", update(OrderStatus::Failed)).await.unwrap();
        let outcome = service
            .update_status("o1", update(OrderStatus::Refunded))
            .await
            .unwrap();
        assert!(outcome.refund.is_none());
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_no_reservation_still_updates() {
        let (store, _ledger, service) = setup();
        let outcome = service
            .update_status("o1", update(OrderStatus::Failed))
            .await
            .unwrap();
        assert!(outcome.refund.is_none());
        assert_eq!(store.order("o1").unwrap().status, OrderStatus::Failed);
        assert_eq!(store.user(EMAIL).unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_completion_does_not_touch_ledger() {
        let (store, _ledger, service) = setup();
        let outcome = service
            .update_status(
                "o1",
                StatusUpdate {
                    status: OrderStatus::Completed,
                    admin_notes: None,
                    result: Some("UNLOCK-1".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.order.result.as_deref(), Some("UNLOCK-1"));
        assert!(store.balance_log().is_empty());
    }

    #[tokio::test]
    async fn test_refund_failure_aborts_update() {
        let (store, ledger, service) = setup();
        ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();
        store.inject_failure("compare_and_swap_balance");

        let err = service
            .update_status("o1", update(OrderStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Ledger(_)));
        assert_eq!(store.order("o1").unwrap().status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_settling_order_closes_external_record() {
        let (store, ledger, service) = setup();
        ledger.reserve(EMAIL, dec!(10), "o1", "Unlock").await.unwrap();
        let now = Utc::now();
        store.insert_external_order(ExternalOrder {
            id: "ext-1".into(),
            local_order_id: "o1".into(),
            provider_id: "prov-1".into(),
            external_order_id: "EXT-1".into(),
            status: ExternalOrderStatus::Processing,
            external_status: "processing".into(),
            result: None,
            request_payload: "{}".into(),
            response_payload: "{}".into(),
            last_check: None,
            created_at: now,
            updated_at: now,
        });

        service
            .update_status("o1", update(OrderStatus::Refunded))
            .await
            .unwrap();

        let record = store.external_order_for("o1").unwrap();
        assert_eq!(record.status, ExternalOrderStatus::Closed);
        assert_eq!(record.external_status, "processing");
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let (_store, _ledger, service) = setup();
        let err = service
            .update_status("nope", update(OrderStatus::Failed))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
