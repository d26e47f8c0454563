//! Order Status Poller
//!
//! Background worker that re-checks upstream status of submitted orders.
//!
//! Per tick: open external orders (submitted / processing), least recently
//! updated first, bounded batch. A changed status updates the external order
//! and its local order, writes one notification and sends a best-effort email.
//!
//! The poller never touches balances. A provider-reported failure marks the
//! order failed; refunding it is an admin decision. Orders an admin already
//! settled are never overwritten: their external record is closed instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::{
    ExternalOrder, ExternalOrderStatus, Notification, Order, OrderStatus, new_id,
};
use crate::notify::{EmailMessage, EmailSender};
use crate::provider::{MapperError, MapperRegistry, ProviderFailure, SubmissionAdapter};
use crate::store::{EntityStore, StoreError};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between ticks
    pub poll_interval: Duration,
    /// Maximum external orders checked per tick
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("External order {0} has no provider order id")]
    MissingExternalId(String),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error("Status check failed: {0}")]
    Provider(#[from] ProviderFailure),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normalize a raw provider status string
///
/// ```text
/// success | completed | approved → completed
/// processing | in_progress       → processing
/// failed | error | rejected      → failed
/// pending | anything else        → pending (submitted)
/// ```
///
/// A pending answer for a record already processing leaves it processing,
/// see [`StatusPoller`].
pub fn map_provider_status(raw: &str) -> ExternalOrderStatus {
    match raw.trim().to_lowercase().as_str() {
        "success" | "completed" | "approved" => ExternalOrderStatus::Completed,
        "processing" | "in_progress" => ExternalOrderStatus::Processing,
        "failed" | "error" | "rejected" => ExternalOrderStatus::Failed,
        _ => ExternalOrderStatus::Submitted,
    }
}

fn local_status(status: ExternalOrderStatus) -> OrderStatus {
    match status {
        ExternalOrderStatus::Completed => OrderStatus::Completed,
        ExternalOrderStatus::Failed | ExternalOrderStatus::Closed => OrderStatus::Failed,
        ExternalOrderStatus::Submitted | ExternalOrderStatus::Processing => OrderStatus::Processing,
    }
}

/// The local side of an external record
enum LocalOrder {
    Open(Order),
    Missing,
    /// Settled by an admin; the external record has been closed
    Settled,
}

pub struct StatusPoller {
    store: Arc<dyn EntityStore>,
    mappers: Arc<MapperRegistry>,
    adapter: Arc<SubmissionAdapter>,
    email: Arc<dyn EmailSender>,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn EntityStore>,
        mappers: Arc<MapperRegistry>,
        adapter: Arc<SubmissionAdapter>,
        email: Arc<dyn EmailSender>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            mappers,
            adapter,
            email,
            config,
        }
    }

    /// Poll forever
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting status poller"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Status poll failed");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One tick. Per-order failures are counted, not propagated.
    pub async fn poll_once(&self) -> Result<PollSummary, StoreError> {
        let open = self
            .store
            .list_open_external_orders(self.config.batch_size)
            .await?;

        let mut summary = PollSummary::default();
        if open.is_empty() {
            debug!("No open external orders");
            return Ok(summary);
        }

        for record in open {
            summary.checked += 1;
            let id = record.id.clone();
            match self.poll_one(record).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(external_order = %id, error = %e, "Status check skipped");
                }
            }
        }

        info!(
            checked = summary.checked,
            updated = summary.updated,
            failed = summary.failed,
            "Status poll finished"
        );
        Ok(summary)
    }

    /// Returns whether the status changed
    async fn poll_one(&self, mut record: ExternalOrder) -> Result<bool, PollError> {
        if let LocalOrder::Settled = self.local_order(&mut record).await? {
            return Ok(false);
        }

        let provider = self
            .store
            .get_provider(&record.provider_id)
            .await?
            .ok_or_else(|| PollError::ProviderNotFound(record.provider_id.clone()))?;

        if record.external_order_id.is_empty() {
            return Err(PollError::MissingExternalId(record.id));
        }

        let mapping = self.mappers.resolve(&provider)?;
        let report = self
            .adapter
            .check_status(&provider, &mapping, &record.external_order_id)
            .await?;

        let new_status = match (record.status, map_provider_status(&report.raw_status)) {
            (ExternalOrderStatus::Processing, ExternalOrderStatus::Submitted) => {
                ExternalOrderStatus::Processing
            }
            (_, reported) => reported,
        };
        let changed = new_status != record.status;

        // Re-read: an admin may have settled the order during the status call
        let local = if changed {
            self.local_order(&mut record).await?
        } else {
            LocalOrder::Missing
        };
        if let LocalOrder::Settled = local {
            return Ok(false);
        }

        let now = Utc::now();
        record.last_check = Some(now);
        record.external_status = report.raw_status.clone();
        record.updated_at = now;
        if changed {
            record.status = new_status;
            if report.result.is_some() {
                record.result = report.result.clone();
            }
        }
        self.store.update_external_order(&record).await?;

        if !changed {
            return Ok(false);
        }

        info!(
            local_order_id = %record.local_order_id,
            external_order_id = %record.external_order_id,
            status = %new_status,
            raw_status = %report.raw_status,
            "External order status changed"
        );

        let LocalOrder::Open(mut order) = local else {
            warn!(local_order_id = %record.local_order_id, "Linked order missing");
            return Ok(true);
        };

        order.status = local_status(new_status);
        if record.result.is_some() {
            order.result = record.result.clone();
        }
        self.store.update_order(&order).await?;

        let title = format!("Order {}", order.status);
        let mut message = format!("Your order {} is now {}.", order.id, order.status);
        if let (OrderStatus::Completed, Some(result)) = (order.status, &order.result) {
            message.push_str(&format!(" Result: {result}"));
        }

        let notification = Notification {
            id: new_id(),
            user_email: order.created_by.clone(),
            order_id: Some(order.id.clone()),
            title: title.clone(),
            message: message.clone(),
            is_read: false,
            created_at: now,
        };
        if let Err(e) = self.store.create_notification(&notification).await {
            warn!(order_id = %order.id, error = %e, "Failed to store notification");
        }

        let email = EmailMessage {
            to: order.created_by.clone(),
            subject: title,
            html: format!("<p>{message}</p>"),
        };
        if let Err(e) = self.email.send(&email).await {
            warn!(order_id = %order.id, error = %e, "Status email not delivered");
        }

        Ok(true)
    }

    /// Load the linked order. A settled one closes `record` without asking
    /// the provider again.
    async fn local_order(&self, record: &mut ExternalOrder) -> Result<LocalOrder, PollError> {
        let Some(order) = self.store.get_order(&record.local_order_id).await? else {
            return Ok(LocalOrder::Missing);
        };
        if !order.status.is_closed() {
            return Ok(LocalOrder::Open(order));
        }

        info!(
            local_order_id = %record.local_order_id,
            external_order_id = %record.external_order_id,
            local_status = %order.status,
            "Order already settled locally, closing external record"
        );
        let now = Utc::now();
        record.status = ExternalOrderStatus::Closed;
        record.last_check = Some(now);
        record.updated_at = now;
        self.store.update_external_order(record).await?;
        Ok(LocalOrder::Settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiFormat, ApiProvider, Order, User, WireProtocol};
    use crate::notify::mock::MockEmailSender;
    use crate::provider::{
        AdapterConfig, HttpRequest, HttpResponse, HttpTransport, MockTransport, TransportError,
    };
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Harness {
        poller: StatusPoller,
        store: Arc<MemoryStore>,
        transport: Arc<MockTransport>,
        email: Arc<MockEmailSender>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new("buyer@example.com", dec!(40)));
        store.insert_provider(ApiProvider {
            id: "prov-1".into(),
            name: "Upstream".into(),
            base_url: "https://upstream.example.com".into(),
            api_key: "k".into(),
            username: None,
            api_format: ApiFormat::Json,
            wire_protocol: Some(WireProtocol::Json),
            is_active: true,
            auto_submit_enabled: true,
        });
        let mut order = Order::new("ord-1", "svc-1", dec!(10), "buyer@example.com");
        order.status = OrderStatus::Processing;
        store.insert_order(order);
        store.insert_external_order(external("ext-1", "ord-1", "EXT-1"));

        let transport = Arc::new(MockTransport::new());
        let adapter = SubmissionAdapter::new(
            transport.clone(),
            AdapterConfig {
                timeout: Duration::from_millis(100),
                status_retries: 0,
                status_backoff: Duration::from_millis(1),
            },
        );
        let email = Arc::new(MockEmailSender::new());
        let poller = StatusPoller::new(
            store.clone(),
            Arc::new(MapperRegistry::new()),
            Arc::new(adapter),
            email.clone(),
            PollerConfig::default(),
        );
        Harness {
            poller,
            store,
            transport,
            email,
        }
    }

    fn external(id: &str, local: &str, remote: &str) -> ExternalOrder {
        let now = Utc::now();
        ExternalOrder {
            id: id.into(),
            local_order_id: local.into(),
            provider_id: "prov-1".into(),
            external_order_id: remote.into(),
            status: ExternalOrderStatus::Submitted,
            external_status: "submitted".into(),
            result: None,
            request_payload: "{}".into(),
            response_payload: "{}".into(),
            last_check: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_mapping() {
        use ExternalOrderStatus::*;
        for (raw, expected) in [
            ("success", Completed),
            ("Completed", Completed),
            ("APPROVED", Completed),
            ("pending", Submitted),
            ("processing", Processing),
            ("in_progress", Processing),
            ("failed", Failed),
            ("error", Failed),
            ("rejected", Failed),
            ("weird", Submitted),
            ("", Submitted),
        ] {
            assert_eq!(map_provider_status(raw), expected, "raw status {raw:?}");
        }
    }

    #[tokio::test]
    async fn test_completion_updates_and_notifies_once() {
        let h = harness();
        h.transport
            .push_json(200, json!({"status": "completed", "result": "UNLOCK-1234"}));

        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                checked: 1,
                updated: 1,
                failed: 0
            }
        );

        let record = h.store.external_order_for("ord-1").unwrap();
        assert_eq!(record.status, ExternalOrderStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("UNLOCK-1234"));
        assert!(record.last_check.is_some());

        let order = h.store.order("ord-1").unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.result.as_deref(), Some("UNLOCK-1234"));

        assert_eq!(h.store.notifications().len(), 1);
        assert_eq!(h.email.sent().len(), 1);

        // Completed orders are no longer polled
        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(summary.checked, 0);
        assert_eq!(h.store.notifications().len(), 1);
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_status_only_refreshes_last_check() {
        let h = harness();
        h.transport.push_json(200, json!({"status": "pending"}));
        h.transport.push_json(200, json!({"status": "PENDING"}));

        for _ in 0..2 {
            let summary = h.poller.poll_once().await.unwrap();
            assert_eq!(summary.updated, 0);
        }

        let record = h.store.external_order_for("ord-1").unwrap();
        assert_eq!(record.status, ExternalOrderStatus::Submitted);
        assert_eq!(record.external_status, "PENDING");
        assert!(record.last_check.is_some());
        assert!(h.store.notifications().is_empty());
        assert!(h.email.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_touch_balance() {
        let h = harness();
        h.transport.push_json(200, json!({"status": "rejected"}));

        h.poller.poll_once().await.unwrap();
        assert_eq!(h.store.order("ord-1").unwrap().status, OrderStatus::Failed);
        assert_eq!(h.store.user("buyer@example.com").unwrap().balance, dec!(40));
        assert!(h.store.balance_log().is_empty());
    }

    #[tokio::test]
    async fn test_email_failure_is_swallowed() {
        let h = harness();
        h.email.set_fail(true);
        h.transport.push_json(200, json!({"status": "processing"}));

        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(h.store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_per_order_failures_do_not_abort_tick() {
        let h = harness();
        let mut orphan = external("ext-2", "ord-2", "EXT-2");
        orphan.provider_id = "missing".into();
        orphan.updated_at = Utc::now() - chrono::Duration::minutes(5);
        h.store.insert_external_order(orphan);

        h.transport.push_json(500, json!({"error": "down"}));

        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.updated, 0);
    }

    #[tokio::test]
    async fn test_pending_answer_keeps_processing_record() {
        let h = harness();
        let mut record = h.store.external_order_for("ord-1").unwrap();
        record.status = ExternalOrderStatus::Processing;
        h.store.insert_external_order(record);
        h.transport.push_json(200, json!({"status": "pending"}));
        h.transport.push_json(200, json!({"status": "processing"}));

        for _ in 0..2 {
            let summary = h.poller.poll_once().await.unwrap();
            assert_eq!(summary.updated, 0);
        }

        let record = h.store.external_order_for("ord-1").unwrap();
        assert_eq!(record.status, ExternalOrderStatus::Processing);
        assert!(h.store.notifications().is_empty());
        assert!(h.email.sent().is_empty());
    }

    #[tokio::test]
    async fn test_settled_order_is_closed_without_provider_call() {
        let h = harness();
        let mut order = h.store.order("ord-1").unwrap();
        order.status = OrderStatus::Refunded;
        h.store.insert_order(order);
        h.transport
            .push_json(200, json!({"status": "completed", "result": "UNLOCK-1"}));

        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(h.transport.call_count(), 0);

        let record = h.store.external_order_for("ord-1").unwrap();
        assert_eq!(record.status, ExternalOrderStatus::Closed);
        let order = h.store.order("ord-1").unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert!(order.result.is_none());
        assert!(h.store.notifications().is_empty());

        // Closed records drop out of the open list
        assert_eq!(h.poller.poll_once().await.unwrap().checked, 0);
    }

    /// Settles the local order while the provider is answering
    struct SettleDuringCall {
        inner: Arc<MockTransport>,
        store: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl HttpTransport for SettleDuringCall {
        async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            if let Some(mut order) = self.store.order("ord-1") {
                order.status = OrderStatus::Refunded;
                self.store.insert_order(order);
            }
            self.inner.post(request).await
        }
    }

    #[tokio::test]
    async fn test_order_settled_during_status_call_is_not_overwritten() {
        let h = harness();
        let adapter = SubmissionAdapter::new(
            Arc::new(SettleDuringCall {
                inner: h.transport.clone(),
                store: h.store.clone(),
            }),
            AdapterConfig {
                timeout: Duration::from_millis(100),
                status_retries: 0,
                status_backoff: Duration::from_millis(1),
            },
        );
        let poller = StatusPoller::new(
            h.store.clone(),
            Arc::new(MapperRegistry::new()),
            Arc::new(adapter),
            h.email.clone(),
            PollerConfig::default(),
        );
        h.transport
            .push_json(200, json!({"status": "completed", "result": "UNLOCK-1"}));

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.store.order("ord-1").unwrap().status, OrderStatus::Refunded);
        assert_eq!(
            h.store.external_order_for("ord-1").unwrap().status,
            ExternalOrderStatus::Closed
        );
        assert!(h.email.sent().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_aborts_tick() {
        let h = harness();
        h.store.inject_failure("list_open_external_orders");
        assert!(h.poller.poll_once().await.is_err());
    }
}
